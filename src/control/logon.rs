//! The `Logon` operation (§4.2).
//!
//! States: `Welcome -> [AuthTls -> AuthWait]? -> Logon -> Syst -> Feat ->
//! [Clnt]? -> [OptsUtf8]? -> [Pbsz -> Prot]? -> [OptsMlst]? ->
//! CustomCommands* -> Done`. TCP dial and an *implicit* TLS handshake
//! (`FTPS`) happen in [`super::socket::ControlSocket::connect`] before this
//! op is ever pushed; this op's first `parse_response` call always sees the
//! server banner, matching `logon.h`'s `logon_init` state starting the
//! moment the control socket is already connected.

use std::collections::VecDeque;

use crate::control::{OpContext, OpData, OpOutcome};
use crate::reply::Reply;
use crate::server_info::{LogonType, Protocol};
use crate::status::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Welcome,
    AuthTls,
    AuthSslFallback,
    Logon,
    Syst,
    Feat,
    Clnt,
    OptsUtf8,
    Pbsz,
    Prot,
    OptsMlst,
    CustomCommands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStep {
    User,
    Pass,
    Acct,
}

/// Drives the post-connect handshake: banner check, optional explicit TLS
/// upgrade, the `USER`/`PASS`/`ACCT` sequence, capability discovery, and
/// the small set of `OPTS`/`PBSZ`/`PROT` follow-ups capability discovery
/// unlocks.
pub struct LogonOp {
    state: State,
    login_steps: VecDeque<LoginStep>,
    custom_commands: VecDeque<String>,
}

impl LogonOp {
    /// Builds a fresh logon op. `post_login_commands` comes from
    /// `Server::post_login_commands` (§3).
    pub fn new(post_login_commands: Vec<String>) -> Self {
        LogonOp {
            state: State::Welcome,
            login_steps: VecDeque::from([LoginStep::User]),
            custom_commands: VecDeque::from(post_login_commands),
        }
    }
}

impl OpData for LogonOp {
    fn name(&self) -> &'static str {
        "logon"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Welcome => OpOutcome::Suspend, // waiting for the banner reply
            State::AuthTls => OpOutcome::SendCommand("AUTH TLS".to_string()),
            State::AuthSslFallback => OpOutcome::SendCommand("AUTH SSL".to_string()),
            State::Logon => send_login_step(self, ctx),
            State::Syst => OpOutcome::SendCommand("SYST".to_string()),
            State::Feat => OpOutcome::SendCommand("FEAT".to_string()),
            State::Clnt => OpOutcome::SendCommand("CLNT ftp-engine".to_string()),
            State::OptsUtf8 => OpOutcome::SendCommand("OPTS UTF8 ON".to_string()),
            State::Pbsz => OpOutcome::SendCommand("PBSZ 0".to_string()),
            State::Prot => OpOutcome::SendCommand("PROT P".to_string()),
            State::OptsMlst => {
                let facts = ctx.shared.capabilities.snapshot(&ctx.server).mlsd_facts.join(";");
                OpOutcome::SendCommand(format!("OPTS MLST {facts};"))
            }
            State::CustomCommands => match self.custom_commands.pop_front() {
                Some(cmd) => OpOutcome::SendCommand(cmd),
                None => {
                    ctx.logon_in_progress = false;
                    OpOutcome::Done(OpStatus::OK)
                }
            },
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        match self.state {
            State::Welcome => {
                if reply.last_line().to_ascii_lowercase().starts_with("ssh") {
                    return OpOutcome::Done(OpStatus::ERROR | OpStatus::CRITICAL_ERROR | OpStatus::DISCONNECTED);
                }
                self.state = match ctx.server.protocol {
                    Protocol::Ftpes => State::AuthTls,
                    _ => State::Logon,
                };
                OpOutcome::Continue
            }
            State::AuthTls => {
                if reply.class() == 2 {
                    ctx.protect_data_channel = false; // finalized after PROT P
                    ctx.pending_tls_upgrade = true;
                    self.state = State::Logon;
                    OpOutcome::Suspend
                } else {
                    self.state = State::AuthSslFallback;
                    OpOutcome::Continue
                }
            }
            State::AuthSslFallback => {
                if reply.class() != 2 {
                    return OpOutcome::Done(OpStatus::ERROR | OpStatus::CRITICAL_ERROR | OpStatus::DISCONNECTED);
                }
                ctx.protect_data_channel = false; // finalized after PROT P
                ctx.pending_tls_upgrade = true;
                self.state = State::Logon;
                OpOutcome::Suspend
            }
            State::Logon => parse_login_reply(self, ctx, reply),
            State::Syst => {
                // Best-effort; a failure here is never fatal (§4.2).
                self.state = State::Feat;
                OpOutcome::Continue
            }
            State::Feat => {
                if reply.class() == 2 {
                    ctx.shared.capabilities.with(&ctx.server, |caps| {
                        for line in &reply.lines()[1..reply.lines().len().saturating_sub(1)] {
                            caps.observe_feat_line(line);
                        }
                    });
                }
                self.state = if ctx.shared.capabilities.snapshot(&ctx.server).clnt.is_yes() {
                    State::Clnt
                } else {
                    next_state_after_clnt(ctx)
                };
                OpOutcome::Continue
            }
            State::Clnt => {
                // Best-effort.
                self.state = next_state_after_clnt(ctx);
                OpOutcome::Continue
            }
            State::OptsUtf8 => {
                // Best-effort; failure just means we keep talking in the
                // fallback charset (§6).
                self.state = next_state_after_utf8(ctx);
                OpOutcome::Continue
            }
            State::Pbsz => {
                self.state = State::Prot;
                OpOutcome::Continue
            }
            State::Prot => {
                ctx.protect_data_channel = reply.class() == 2;
                self.state = next_state_after_prot(ctx);
                OpOutcome::Continue
            }
            State::OptsMlst => {
                // Best-effort.
                self.state = State::CustomCommands;
                OpOutcome::Continue
            }
            State::CustomCommands => {
                // Non-fatal failures are ignored (§4.2).
                OpOutcome::Continue
            }
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        OpOutcome::Done(result)
    }
}

fn next_state_after_clnt(ctx: &OpContext) -> State {
    let caps = ctx.shared.capabilities.snapshot(&ctx.server);
    let wants_utf8 = matches!(ctx.server.encoding, crate::server_info::Encoding::Auto | crate::server_info::Encoding::Utf8);
    if wants_utf8 && caps.utf8.is_yes() {
        State::OptsUtf8
    } else {
        next_state_after_utf8(ctx)
    }
}

fn next_state_after_utf8(ctx: &OpContext) -> State {
    if requires_tls(ctx.server.protocol) {
        State::Pbsz
    } else {
        next_state_after_prot(ctx)
    }
}

fn next_state_after_prot(ctx: &OpContext) -> State {
    let caps = ctx.shared.capabilities.snapshot(&ctx.server);
    if caps.mlsd.is_yes() || caps.mlst.is_yes() {
        State::OptsMlst
    } else {
        State::CustomCommands
    }
}

fn requires_tls(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Ftps | Protocol::Ftpes)
}

fn send_login_step(op: &mut LogonOp, ctx: &mut OpContext) -> OpOutcome {
    let Some(step) = op.login_steps.front().copied() else {
        op.state = State::Syst;
        return OpOutcome::Continue;
    };
    if let Some(reply) = ctx.interactive_login_reply.take() {
        match step {
            LoginStep::User => ctx.credentials.user = Some(reply),
            LoginStep::Pass => ctx.credentials.password = Some(reply),
            LoginStep::Acct => ctx.credentials.account = Some(reply),
        }
    }
    match step {
        LoginStep::User => {
            let user = ctx.credentials.user.clone().unwrap_or_else(|| "anonymous".to_string());
            OpOutcome::SendCommand(format!("USER {user}"))
        }
        LoginStep::Pass => {
            if matches!(ctx.credentials.logon_type, LogonType::Ask) && ctx.credentials.password.is_none() {
                if ctx.pending_interactive_login_prompt.is_some() {
                    return OpOutcome::Suspend;
                }
                ctx.pending_interactive_login_prompt = Some("password".to_string());
                return OpOutcome::Suspend;
            }
            let pass = ctx.credentials.password.clone().unwrap_or_default();
            OpOutcome::SendCommand(format!("PASS {pass}"))
        }
        LoginStep::Acct => {
            let acct = ctx.credentials.account.clone().unwrap_or_default();
            OpOutcome::SendCommand(format!("ACCT {acct}"))
        }
    }
}

fn parse_login_reply(op: &mut LogonOp, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
    let Some(step) = op.login_steps.pop_front() else {
        return OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL);
    };
    match step {
        LoginStep::User => match reply.class() {
            2 => {
                op.state = State::Syst;
                OpOutcome::Continue
            }
            3 => {
                op.login_steps.push_back(LoginStep::Pass);
                OpOutcome::Continue
            }
            _ => login_failure(ctx, reply, LoginStep::User, &mut op.login_steps),
        },
        LoginStep::Pass => match reply.class() {
            2 => {
                op.state = State::Syst;
                OpOutcome::Continue
            }
            3 => {
                op.login_steps.push_back(LoginStep::Acct);
                OpOutcome::Continue
            }
            _ => login_failure(ctx, reply, LoginStep::Pass, &mut op.login_steps),
        },
        LoginStep::Acct => match reply.class() {
            2 => {
                op.state = State::Syst;
                OpOutcome::Continue
            }
            _ => login_failure(ctx, reply, LoginStep::Acct, &mut op.login_steps),
        },
    }
}

/// On a rejected login step, a `LogonType::Interactive` connection asks the
/// host for a fresh credential and retries the same step rather than
/// failing outright, re-queuing `step` at the front of `login_steps` so
/// `send_login_step` re-sends it once the host answers.
fn login_failure(ctx: &mut OpContext, reply: &Reply, step: LoginStep, login_steps: &mut VecDeque<LoginStep>) -> OpOutcome {
    if matches!(ctx.credentials.logon_type, LogonType::Interactive) {
        login_steps.push_front(step);
        ctx.pending_interactive_login_prompt = Some(reply.full_text());
        return OpOutcome::Suspend;
    }
    tracing::warn!(trace_id = %ctx.trace_id, code = reply.code(), "login rejected");
    OpOutcome::Done(OpStatus::ERROR | OpStatus::CRITICAL_ERROR | OpStatus::PASSWORD_FAILED | OpStatus::DISCONNECTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::EngineShared;
    use crate::options::EngineOptions;
    use crate::server_info::{Credentials, Server};

    fn ctx() -> OpContext {
        OpContext::new(EngineShared::default(), Server::new("example.com", 21, Protocol::Ftp), Credentials::anonymous(), EngineOptions::default())
    }

    #[test]
    fn ssh_banner_is_fatal() {
        let mut op = LogonOp::new(vec![]);
        let mut c = ctx();
        let outcome = op.parse_response(&mut c, &Reply::single(220, "SSH-2.0-OpenSSH_8.4"));
        match outcome {
            OpOutcome::Done(status) => {
                assert!(status.is_critical());
                assert!(status.contains(OpStatus::DISCONNECTED));
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn plain_ftp_banner_then_user_then_pass_ok() {
        let mut op = LogonOp::new(vec![]);
        let mut c = ctx();
        assert!(matches!(op.parse_response(&mut c, &Reply::single(220, "hi")), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "USER anonymous"));
        assert!(matches!(op.parse_response(&mut c, &Reply::single(331, "need password")), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "PASS anonymous@"));
        assert!(matches!(op.parse_response(&mut c, &Reply::single(230, "logged in")), OpOutcome::Continue));
    }

    #[test]
    fn auth_tls_accept_suspends_for_handshake_before_logon() {
        let mut op = LogonOp::new(vec![]);
        let mut c = ctx();
        c.server.protocol = Protocol::Ftpes;
        op.parse_response(&mut c, &Reply::single(220, "hi"));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "AUTH TLS"));
        let outcome = op.parse_response(&mut c, &Reply::single(234, "auth tls ok"));
        assert!(matches!(outcome, OpOutcome::Suspend));
        assert!(c.pending_tls_upgrade);
        // Once the event loop clears the flag after the handshake, driving
        // further resumes at the Logon state rather than re-sending AUTH TLS.
        c.pending_tls_upgrade = false;
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "USER anonymous"));
    }

    #[test]
    fn five_xx_on_user_fails_fast_for_non_interactive() {
        let mut op = LogonOp::new(vec![]);
        let mut c = ctx();
        op.parse_response(&mut c, &Reply::single(220, "hi"));
        let outcome = op.parse_response(&mut c, &Reply::single(530, "not logged in"));
        match outcome {
            OpOutcome::Done(status) => assert!(status.contains(OpStatus::PASSWORD_FAILED)),
            _ => panic!("expected Done"),
        }
    }
}
