//! The `RawCommand` operation (§4.8), grounded on
//! `CFtpControlSocket::RawCommand`.
//!
//! Sends exactly one command verbatim and reports its reply back as a
//! notification, for host-driven commands this crate has no dedicated
//! operation for (`SITE` subcommands, `NOOP`, vendor extensions).

use crate::control::{OpContext, OpData, OpOutcome};
use crate::notification::{MessageCategory, Notification};
use crate::reply::Reply;
use crate::status::OpStatus;

/// Sends `command` once and reports its reply.
pub struct RawCommandOp {
    command: String,
    sent: bool,
}

impl RawCommandOp {
    /// Builds a `RawCommand` op sending `command` verbatim.
    pub fn new(command: impl Into<String>) -> Self {
        RawCommandOp { command: command.into(), sent: false }
    }
}

impl OpData for RawCommandOp {
    fn name(&self) -> &'static str {
        "raw_command"
    }

    fn send(&mut self, _ctx: &mut OpContext) -> OpOutcome {
        self.sent = true;
        OpOutcome::SendCommand(self.command.clone())
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        ctx.pending_notifications.push(Notification::Log {
            category: MessageCategory::Response,
            text: reply.full_text(),
        });
        if matches!(reply.class(), 2 | 3) {
            OpOutcome::Done(OpStatus::OK)
        } else {
            OpOutcome::Done(OpStatus::ERROR)
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        OpOutcome::Done(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::EngineShared;
    use crate::options::EngineOptions;
    use crate::server_info::{Credentials, Protocol, Server};

    fn ctx() -> OpContext {
        OpContext::new(EngineShared::default(), Server::new("example.com", 21, Protocol::Ftp), Credentials::anonymous(), EngineOptions::default())
    }

    #[test]
    fn sends_verbatim_and_reports_ok_on_2xx() {
        let mut op = RawCommandOp::new("NOOP");
        let mut c = ctx();
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "NOOP"));
        let outcome = op.parse_response(&mut c, &Reply::single(200, "ok"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
        assert_eq!(c.pending_notifications.len(), 1);
    }

    #[test]
    fn five_xx_reports_error() {
        let mut op = RawCommandOp::new("SITE BOGUS");
        let mut c = ctx();
        op.send(&mut c);
        let outcome = op.parse_response(&mut c, &Reply::single(500, "unknown command"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_error()));
    }
}
