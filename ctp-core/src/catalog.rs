//! Static error catalog.
//!
//! Every symbolic error code the API can emit is described here: HTTP
//! status, category, severity, user-safe message variants, and operator
//! documentation. Handlers never format user-visible strings themselves;
//! they pick a code and the boundary renders it.

use axum::http::StatusCode;

/// Broad classification used for logging and client grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimit,
    Server,
    ServiceUnavailable,
    NotImplemented,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Server => "server",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::NotImplemented => "not_implemented",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One catalog row. The `plain` message is what production clients see;
/// `markdown` and `html` variants exist for richer frontends.
#[derive(Debug, Clone, Copy)]
pub struct ErrorDefinition {
    pub code: &'static str,
    pub http_status: StatusCode,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub title: &'static str,
    pub plain: &'static str,
    pub markdown: &'static str,
    pub html: &'static str,
    pub internal_description: &'static str,
    pub common_causes: &'static [&'static str],
    pub resolution_steps: &'static [&'static str],
    /// Seconds for the `Retry-After` header, where applicable.
    pub retry_after: Option<u64>,
}

macro_rules! def {
    ($code:literal, $status:expr, $cat:expr, $sev:expr, $title:literal, $plain:literal,
     desc: $desc:literal, causes: [$($cause:literal),*], steps: [$($step:literal),*]
     $(, retry: $retry:literal)?) => {
        ErrorDefinition {
            code: $code,
            http_status: $status,
            category: $cat,
            severity: $sev,
            title: $title,
            plain: $plain,
            markdown: concat!("**", $title, "**\n\n", $plain),
            html: concat!("<strong>", $title, "</strong><p>", $plain, "</p>"),
            internal_description: $desc,
            common_causes: &[$($cause),*],
            resolution_steps: &[$($step),*],
            retry_after: def!(@retry $($retry)?),
        }
    };
    (@retry) => { None };
    (@retry $retry:literal) => { Some($retry) };
}

/// Full registry. Lookup is linear; the table is small and read rarely
/// outside of error paths.
pub static ERROR_CATALOG: &[ErrorDefinition] = &[
    def!("AUTH_001", StatusCode::UNAUTHORIZED, ErrorCategory::Authentication, ErrorSeverity::Warning,
        "Authentication required", "Authentication credentials were missing or invalid.",
        desc: "No provider in the registry produced a principal for the request.",
        causes: ["Missing Authorization header", "Wrong username or password", "Malformed bearer token"],
        steps: ["Log in again", "Check the Authorization header format"]),
    def!("AUTH_002", StatusCode::UNAUTHORIZED, ErrorCategory::Authentication, ErrorSeverity::Warning,
        "Credential expired", "The presented credential has expired.",
        desc: "Session or API token is past its expires_at.",
        causes: ["Expired session", "Expired API token"],
        steps: ["Refresh the session", "Issue a new token"]),
    def!("AUTH_003", StatusCode::UNAUTHORIZED, ErrorCategory::Authentication, ErrorSeverity::Warning,
        "Refresh rejected", "The refresh token is invalid or was already used.",
        desc: "Refresh tokens are single-use; the presented digest matched no active session.",
        causes: ["Replayed refresh token", "Session revoked"],
        steps: ["Log in again"]),
    def!("AUTH_004", StatusCode::UNAUTHORIZED, ErrorCategory::Authentication, ErrorSeverity::Warning,
        "Password reset required", "Your password must be reset before logging in.",
        desc: "The stored credential is legacy-encrypted or flagged password_reset_required.",
        causes: ["Legacy credential migrated without rehash"],
        steps: ["Use the password reset flow"]),
    def!("AUTHZ_001", StatusCode::FORBIDDEN, ErrorCategory::Authorization, ErrorSeverity::Warning,
        "Forbidden", "You do not have permission to perform this action.",
        desc: "Principal is authenticated but the permission engine denied the action.",
        causes: ["Insufficient course role", "Missing general claim"],
        steps: ["Ask a course lecturer or an administrator"]),
    def!("VAL_001", StatusCode::BAD_REQUEST, ErrorCategory::Validation, ErrorSeverity::Info,
        "Validation failed", "Request validation failed.",
        desc: "Schema or invariant violation on the request payload.",
        causes: ["Missing required field", "Field out of range"],
        steps: ["Fix the fields listed in details and retry"]),
    def!("VAL_002", StatusCode::BAD_REQUEST, ErrorCategory::Validation, ErrorSeverity::Info,
        "Weak password", "The password does not meet the complexity requirements.",
        desc: "Password strength validation failed at set-time.",
        causes: ["Too short", "Missing character classes", "Common password"],
        steps: ["Choose a longer, more varied password"]),
    def!("NF_001", StatusCode::NOT_FOUND, ErrorCategory::NotFound, ErrorSeverity::Info,
        "Not found", "The requested resource was not found.",
        desc: "Entity absent, or present but filtered out by the permission predicate.",
        causes: ["Wrong id", "Caller may not see the entity"],
        steps: ["Check the identifier"]),
    def!("CONF_001", StatusCode::CONFLICT, ErrorCategory::Conflict, ErrorSeverity::Warning,
        "Conflict", "The request conflicts with existing data.",
        desc: "Unique constraint or version conflict on write.",
        causes: ["Duplicate unique value", "Stale version counter"],
        steps: ["Reload the entity and retry"]),
    def!("RATE_001", StatusCode::TOO_MANY_REQUESTS, ErrorCategory::RateLimit, ErrorSeverity::Warning,
        "Too many requests", "Too many requests; slow down.",
        desc: "Rate limiter rejected the request.",
        causes: ["Client retry loop"],
        steps: ["Honor the Retry-After header"],
        retry: 30),
    def!("SRV_001", StatusCode::INTERNAL_SERVER_ERROR, ErrorCategory::Server, ErrorSeverity::Error,
        "Internal error", "An internal error occurred.",
        desc: "Unexpected fault; full detail is in the server log under the request id.",
        causes: ["Bug", "Unhandled backend failure"],
        steps: ["Retry later", "Report the request id"]),
    def!("SRV_002", StatusCode::SERVICE_UNAVAILABLE, ErrorCategory::ServiceUnavailable, ErrorSeverity::Error,
        "Service unavailable", "The service is temporarily overloaded.",
        desc: "Database busy/timeout or other transient backpressure.",
        causes: ["Database timeout", "Connection pool exhausted"],
        steps: ["Retry after the indicated delay"],
        retry: 2),
    def!("NI_001", StatusCode::NOT_IMPLEMENTED, ErrorCategory::NotImplemented, ErrorSeverity::Info,
        "Not implemented", "This operation is not implemented.",
        desc: "Documented stub kept for API-shape stability.",
        causes: ["Feature not built for this target scope"],
        steps: []),
];

/// Fallback returned for codes missing from the catalog.
static UNKNOWN: ErrorDefinition = def!("UNKNOWN", StatusCode::INTERNAL_SERVER_ERROR,
    ErrorCategory::Server, ErrorSeverity::Error,
    "Unknown error", "An error occurred.",
    desc: "Error code not present in the catalog.",
    causes: ["Code emitted without a catalog row"],
    steps: ["Add the code to the catalog"]);

/// Look up a definition by symbolic code.
pub fn definition(code: &str) -> &'static ErrorDefinition {
    ERROR_CATALOG
        .iter()
        .find(|d| d.code == code)
        .unwrap_or(&UNKNOWN)
}

/// All codes in a category, in catalog order.
pub fn by_category(category: ErrorCategory) -> Vec<&'static ErrorDefinition> {
    ERROR_CATALOG.iter().filter(|d| d.category == category).collect()
}
