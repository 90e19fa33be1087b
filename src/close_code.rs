//! WebSocket close-code registry
//!
//! Single responsibility: map close codes to their wire-level semantics and
//! parse/build the `"<SYMBOLIC_ID>[: <payload>]"` reason-string format.
//!
//! The table covers the standard 1000-1015 range plus the six
//! protocol-specific codes in the 3000 range. Some servers can only deliver
//! the generic 1006 abnormal-closure code at the transport level while the
//! real control signal rides in the reason text; [`CloseInfo::parse`]
//! recovers the intended code from the reason's leading symbolic id in that
//! case.

use std::fmt;

/// Normal close by one of the endpoints.
pub const STATEFULL_NORMAL_CLOSE: u16 = 3000;
/// Something failed to follow the protocol.
pub const STATEFULL_PROTOCOL_PROBLEM: u16 = 3001;
/// Unexpected error at an endpoint.
pub const STATEFULL_ERROR: u16 = 3002;
/// Client should reallocate its node.
pub const STATEFULL_ALLOCATE_NODE: u16 = 3003;
/// Session was kicked; nothing is persisted.
pub const STATEFULL_KICK: u16 = 3004;
/// Session was banned; a cooldown is persisted locally.
pub const STATEFULL_BAN: u16 = 3005;

/// No-status close, set locally when no close frame carried a code.
pub const CLOSED_NO_STATUS: u16 = 1005;
/// Abnormal close without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Static metadata for one close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCodeMeta {
    pub name: &'static str,
    pub description: &'static str,
    pub id: &'static str,
}

const UNKNOWN: CloseCodeMeta = CloseCodeMeta {
    name: "Unknown",
    description: "Is a unknown status code.",
    id: "UNKNOWN",
};

static CLOSE_CODES: &[(u16, CloseCodeMeta)] = &[
    (1000, CloseCodeMeta {
        name: "Close normal",
        description: "Indicates a normal closure, meaning that the purpose for which the connection was established has been fulfilled",
        id: "CLOSE_NORMAL",
    }),
    (1001, CloseCodeMeta {
        name: "Close going away",
        description: "Indicates that an endpoint is 'going away', such as a server going down or a browser having navigated away from a page",
        id: "CLOSE_GOING_AWAY",
    }),
    (1002, CloseCodeMeta {
        name: "Close protocol error",
        description: "Indicates that an endpoint is terminating the connection due to a protocol error",
        id: "CLOSE_PROTOCOL_ERROR",
    }),
    (1003, CloseCodeMeta {
        name: "Close unsupported",
        description: "Indicates that an endpoint is terminating the connection because it has received a type of data it cannot accept (e.g., an endpoint that understands only text data MAY send this if it receives a binary message)",
        id: "CLOSE_UNSUPPORTED",
    }),
    // 1004 carries the upstream table's duplicate id; reverse lookup is
    // first-match, so CLOSE_GOING_AWAY resolves to 1001.
    (1004, CloseCodeMeta {
        name: "",
        description: "Reserved. The specific meaning might be defined in the future",
        id: "CLOSE_GOING_AWAY",
    }),
    (1005, CloseCodeMeta {
        name: "Closed no status",
        description: "Is a reserved value and MUST NOT be set as a status code in a Close control frame by an endpoint. It is designated for use in applications expecting a status code to indicate that no status code was actually present",
        id: "CLOSED_NO_STATUS",
    }),
    (1006, CloseCodeMeta {
        name: "Close abnormal",
        description: "Is a reserved value and MUST NOT be set as a status code in a Close control frame by an endpoint. It is designated for use in applications expecting a status code to indicate that the connection was closed abnormally, e.g., without sending or receiving a Close control frame",
        id: "CLOSE_ABNORMAL",
    }),
    (1007, CloseCodeMeta {
        name: "Unsupported payload",
        description: "Indicates that an endpoint is terminating the connection because it has received data within a message that was not consistent with the type of the message (e.g., non-UTF-8 [RFC3629] data within a text message)",
        id: "UNSUPPORTED_PAYLOAD",
    }),
    (1008, CloseCodeMeta {
        name: "Policy violation",
        description: "Indicates that an endpoint is terminating the connection because it has received a message that violates its policy. This is a generic status code that can be returned when there is no other more suitable status code (e.g., 1003 or 1009) or if there is a need to hide specific details about the policy",
        id: "POLICY_VIOLATION",
    }),
    (1009, CloseCodeMeta {
        name: "Close too large",
        description: "Indicates that an endpoint is terminating the connection because it has received a message that is too big for it to process",
        id: "CLOSE_TOO_LARGE",
    }),
    (1010, CloseCodeMeta {
        name: "Mandatory extension",
        description: "Indicates that an endpoint (client) is terminating the connection because it has expected the server to negotiate one or more extension, but the server didn't return them in the response message of the WebSocket handshake. The list of extensions that are needed SHOULD appear in the /reason/ part of the Close frame. Note that this status code is not used by the server, because it can fail the WebSocket handshake instead",
        id: "MANDATORY_EXTENSION",
    }),
    (1011, CloseCodeMeta {
        name: "Server error",
        description: "Indicates that a server is terminating the connection because it encountered an unexpected condition that prevented it from fulfilling the request",
        id: "SERVER_ERROR",
    }),
    (1012, CloseCodeMeta {
        name: "Service restart",
        description: "Indicates that the server / service is restarting",
        id: "SERVICE_RESTART",
    }),
    (1013, CloseCodeMeta {
        name: "Try again later",
        description: "Indicates that a temporary server condition forced blocking the client's request",
        id: "TRY_AGAIN_LATER",
    }),
    (1014, CloseCodeMeta {
        name: "Bad gateway",
        description: "Indicates that the server acting as gateway received an invalid response",
        id: "BAD_GATEWAY",
    }),
    (1015, CloseCodeMeta {
        name: "TLS handshake fail",
        description: "Is a reserved value and MUST NOT be set as a status code in a Close control frame by an endpoint. It is designated for use in applications expecting a status code to indicate that the connection was closed due to a failure to perform a TLS handshake (e.g., the server certificate can't be verified)",
        id: "TLS_HANDSHAKE_FAIL",
    }),
    (STATEFULL_NORMAL_CLOSE, CloseCodeMeta {
        name: "Statefull normal close",
        description: "Indicates the normal close by one of the endpoints",
        id: "STATEFULL_NORMAL_CLOSE",
    }),
    (STATEFULL_PROTOCOL_PROBLEM, CloseCodeMeta {
        name: "Statefull protocol problem",
        description: "Indicates that something failed to follow the protocol",
        id: "STATEFULL_PROTOCOL_PROBLEM",
    }),
    (STATEFULL_ERROR, CloseCodeMeta {
        name: "Statefull error",
        description: "Indicates that an unexpected error has occurred at an endpoint",
        id: "STATEFULL_ERROR",
    }),
    (STATEFULL_ALLOCATE_NODE, CloseCodeMeta {
        name: "Statefull allocate node",
        description: "Indicates the client should reallocate the node",
        id: "STATEFULL_ALLOCATE_NODE",
    }),
    (STATEFULL_KICK, CloseCodeMeta {
        name: "Statefull kick",
        description: "Indicates that the user of the client should manually reload the page",
        id: "STATEFULL_KICK",
    }),
    (STATEFULL_BAN, CloseCodeMeta {
        name: "Statefull ban",
        description: "Indicates that the user of the client should and can no longer use the page. Reloading the page should not establish a new connection.",
        id: "STATEFULL_BAN",
    }),
];

fn lookup(code: u16) -> Option<&'static CloseCodeMeta> {
    CLOSE_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, meta)| meta)
}

/// Look up the metadata for a close code.
///
/// Unknown codes get the `UNKNOWN` placeholder; this never fails.
pub fn describe(code: u16) -> &'static CloseCodeMeta {
    lookup(code).unwrap_or(&UNKNOWN)
}

/// Reverse lookup by symbolic id. First match wins; the table is small
/// enough that a linear scan is fine.
pub fn code_for_id(id: &str) -> Option<u16> {
    CLOSE_CODES
        .iter()
        .find(|(_, meta)| meta.id == id)
        .map(|(code, _)| *code)
}

/// Build a wire reason string: `"<ID>"` or `"<ID>: <payload>"`.
pub fn build_reason(code: u16, payload: Option<&str>) -> String {
    match payload {
        Some(payload) => format!("{}: {}", describe(code).id, payload),
        None => describe(code).id.to_string(),
    }
}

/// Everything known about one socket closure, derived once per close event.
#[derive(Debug, Clone)]
pub struct CloseInfo {
    /// The code the transport delivered
    pub code: u16,
    /// The reason string exactly as received
    pub raw_reason: String,
    /// The reason with the leading `"<ID>:"` tag stripped
    pub reason: String,
    /// Metadata for the resolved code
    pub meta: &'static CloseCodeMeta,
    control: u16,
}

impl CloseInfo {
    /// Parse a close event into its protocol meaning.
    ///
    /// When the delivered code is unknown, or is the degraded 1005/1006
    /// no-status pair, the first `:`-field of the reason is matched exactly
    /// against a symbolic id (uppercased, spaces to underscores) to recover
    /// the intended control code. Anything else keeps the literal code.
    pub fn parse(code: u16, raw_reason: &str) -> Self {
        let mut control = code;
        let mut meta = describe(code);

        let degraded = matches!(code, CLOSED_NO_STATUS | CLOSE_ABNORMAL);
        if lookup(code).is_none() || degraded {
            let token = raw_reason
                .split(':')
                .next()
                .unwrap_or("")
                .trim()
                .to_uppercase()
                .replace(' ', "_");
            if let Some(recovered) = code_for_id(&token) {
                control = recovered;
                meta = describe(recovered);
            }
        }

        let reason = raw_reason
            .split(':')
            .skip(1)
            .collect::<Vec<_>>()
            .join(":");

        Self {
            code,
            raw_reason: raw_reason.to_string(),
            reason,
            meta,
            control,
        }
    }

    /// The code the engine should classify on: the delivered code, or the
    /// one recovered from the reason text when the transport degraded it.
    pub fn control_code(&self) -> u16 {
        self.control
    }
}

fn first_to_lowercase(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Websocket close code: {}\nReason: {}\n{} {}",
            self.code,
            self.reason,
            self.code,
            first_to_lowercase(self.meta.description)
        )
    }
}
