//! Management protocol, data-plane portion.
//!
//! Requests are newline-delimited, space-tokenized lines: `tag args...`.
//! Responses are framed as `status\nlength\n<body>`. Command parsing
//! beyond tokenization lives with the management side; this module only
//! carries the registry, argument-count and auth gating, and the framing.

use std::collections::HashMap;
use std::io::Write;

/// Response status codes, grouped like HTTP: 2xx success, 3xx partial,
/// 4xx client fault, 5xx server fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CliStatus {
    /// Success.
    Ok = 200,
    /// Success, but the body was truncated.
    Truncated = 300,
    /// Malformed request line.
    Syntax = 400,
    /// Unknown tag.
    UnknownRequest = 401,
    /// Too few arguments.
    TooFew = 402,
    /// Too many arguments.
    TooMany = 403,
    /// Bad parameter value.
    Param = 404,
    /// Insufficient auth level.
    Auth = 405,
    /// Valid request, cannot be served right now.
    CantPerform = 500,
    /// Transport-level failure.
    CommsError = 501,
}

impl CliStatus {
    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// A complete response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliResponse {
    /// Outcome code.
    pub status: CliStatus,
    /// Human-readable body (diagnostic on errors).
    pub body: String,
}

impl CliResponse {
    /// Success with a body.
    pub fn ok(body: impl Into<String>) -> CliResponse {
        CliResponse {
            status: CliStatus::Ok,
            body: body.into(),
        }
    }

    /// Failure with a diagnostic.
    pub fn err(status: CliStatus, body: impl Into<String>) -> CliResponse {
        CliResponse {
            status,
            body: body.into(),
        }
    }

    /// Frame onto a writer: `status\nlength\n<body>`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write!(w, "{}\n{}\n{}", self.status.code(), self.body.len(), self.body)
    }
}

/// Handler for one command tag.
pub type CliHandler = Box<dyn Fn(&[&str]) -> CliResponse + Send + Sync>;

struct CliCommand {
    auth: u8,
    min_args: usize,
    max_args: usize,
    handler: CliHandler,
}

/// The command registry with auth gating.
#[derive(Default)]
pub struct CliRegistry {
    commands: HashMap<&'static str, CliCommand>,
}

impl CliRegistry {
    /// Empty registry.
    pub fn new() -> CliRegistry {
        CliRegistry::default()
    }

    /// Register a command. `auth` is the level a request needs to run it.
    pub fn register(
        &mut self,
        tag: &'static str,
        auth: u8,
        min_args: usize,
        max_args: usize,
        handler: CliHandler,
    ) {
        self.commands.insert(
            tag,
            CliCommand {
                auth,
                min_args,
                max_args,
                handler,
            },
        );
    }

    /// Dispatch one request line under the given auth level.
    pub fn dispatch(&self, line: &str, auth: u8) -> CliResponse {
        let mut tokens = line.split_whitespace();
        let Some(tag) = tokens.next() else {
            return CliResponse::err(CliStatus::Syntax, "empty request");
        };
        let args: Vec<&str> = tokens.collect();

        let Some(cmd) = self.commands.get(tag) else {
            return CliResponse::err(CliStatus::UnknownRequest, format!("unknown request '{tag}'"));
        };
        if auth < cmd.auth {
            return CliResponse::err(
                CliStatus::Auth,
                format!("'{tag}' requires auth level {}", cmd.auth),
            );
        }
        if args.len() < cmd.min_args {
            return CliResponse::err(
                CliStatus::TooFew,
                format!("'{tag}' wants at least {} arguments", cmd.min_args),
            );
        }
        if args.len() > cmd.max_args {
            return CliResponse::err(
                CliStatus::TooMany,
                format!("'{tag}' takes at most {} arguments", cmd.max_args),
            );
        }
        (cmd.handler)(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CliRegistry {
        let mut reg = CliRegistry::new();
        reg.register(
            "ping",
            0,
            0,
            0,
            Box::new(|_| CliResponse::ok("PONG")),
        );
        reg.register(
            "backend.set_health",
            10,
            2,
            2,
            Box::new(|args| CliResponse::ok(format!("{} -> {}", args[0], args[1]))),
        );
        reg
    }

    #[test]
    fn test_dispatch_ok() {
        let reg = registry();
        let r = reg.dispatch("ping", 0);
        assert_eq!(r.status, CliStatus::Ok);
        assert_eq!(r.body, "PONG");
    }

    #[test]
    fn test_unknown_and_syntax() {
        let reg = registry();
        assert_eq!(reg.dispatch("nope", 0).status, CliStatus::UnknownRequest);
        assert_eq!(reg.dispatch("   ", 0).status, CliStatus::Syntax);
    }

    #[test]
    fn test_arg_counts() {
        let reg = registry();
        assert_eq!(
            reg.dispatch("backend.set_health b1", 10).status,
            CliStatus::TooFew
        );
        assert_eq!(
            reg.dispatch("backend.set_health b1 sick extra", 10).status,
            CliStatus::TooMany
        );
        assert_eq!(
            reg.dispatch("backend.set_health b1 sick", 10).status,
            CliStatus::Ok
        );
    }

    #[test]
    fn test_auth_gate() {
        let reg = registry();
        let r = reg.dispatch("backend.set_health b1 sick", 0);
        assert_eq!(r.status, CliStatus::Auth);
    }

    #[test]
    fn test_framing() {
        let r = CliResponse::ok("PONG");
        let mut out = Vec::new();
        r.write_to(&mut out).unwrap();
        assert_eq!(out, b"200\n4\nPONG");
    }
}
