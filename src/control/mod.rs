//! The operation-stack protocol engine (§2, §4, §9).
//!
//! SPEC_FULL §9 calls for re-architecting the original's virtual-dispatch,
//! friend-class pointer stack as "a tagged-variant operation type with a
//! uniform trait {`send`, `parse_response`, `subcommand_result`} and an
//! explicit stack owned by the control socket". [`OpData`] is that trait;
//! [`ControlSocket`] owns the `Vec<Box<dyn OpData>>` stack explicitly
//! rather than through back-pointers, grounded on the shape of
//! `server::controlchan::handler::CommandHandler` in the teacher crate
//! (a small trait every command implements) generalized from "one command,
//! one handler" to "one operation, one state machine that may itself
//! dispatch several commands and nested child operations."

pub mod change_dir;
pub mod chmod;
pub mod context;
pub mod delete_op;
pub mod file_transfer;
pub mod list;
pub mod logon;
pub mod mkdir;
pub mod raw_command;
pub mod raw_transfer;
pub mod remove_dir;
pub mod rename;
pub mod socket;

pub use context::{EngineShared, OpContext};
pub use socket::ControlSocket;

use crate::reply::Reply;
use crate::status::OpStatus;

/// What an [`OpData`] call tells the stack-driving loop to do next (§2
/// "Control flow"): the generalized form of the original's
/// `FZ_REPLY_OK` / `FZ_REPLY_CONTINUE` / `FZ_REPLY_WOULDBLOCK` / error
/// return codes.
pub enum OpOutcome {
    /// Dispatch this literal command line on the control channel, then
    /// wait for its reply before calling back into this operation.
    SendCommand(String),
    /// Wait for something other than a control-channel reply: a
    /// `TransferEnd` event, an external-IP resolution, a host reply to an
    /// async prompt, or a keep-alive tick. Control returns to the event
    /// loop; the operation will be resumed when that event arrives.
    Suspend,
    /// The operation is finished; pop it off the stack and propagate
    /// `status` to the parent via `subcommand_result`, or to the host if
    /// the stack is now empty.
    Done(OpStatus),
    /// Push `child` onto the stack. It runs until it completes, then this
    /// operation's `subcommand_result` is invoked with its result.
    Push(Box<dyn OpData>),
    /// Re-invoke `send` immediately; the operation advanced its internal
    /// state without needing any I/O.
    Continue,
}

/// A single state machine in the operation stack (§2, §3 "OpData
/// (abstract)"). Every `Command` variant maps to one implementation of
/// this trait pushed by [`ControlSocket`].
pub trait OpData: Send {
    /// Stable name for diagnostics and `operation-completed` notifications
    /// (§4.1).
    fn name(&self) -> &'static str;

    /// Called when this operation becomes (or remains) the top of the
    /// stack and is ready to make progress: either immediately after being
    /// pushed, or after a child operation it pushed has completed and
    /// `subcommand_result` returned [`OpOutcome::Continue`].
    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome;

    /// Called with the next complete [`Reply`] while this operation is the
    /// top of the stack and has an outstanding command.
    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome;

    /// Called when a child operation this one pushed has completed, with
    /// that child's final status.
    fn subcommand_result(&mut self, ctx: &mut OpContext, result: OpStatus) -> OpOutcome;
}

/// Drives the top-of-stack operation's [`OpData::send`] repeatedly until it
/// yields something other than [`OpOutcome::Continue`] (§4.1 "Dispatch":
/// "`send_next_command` ... calls `send()` on top-of-stack until it
/// returns `WouldBlock`, pops on `Ok`, or propagates `Error`").
///
/// Returns the terminal outcome for the caller (a [`ControlSocket`]) to
/// act on: push a child, dispatch a command, suspend, or unwind with a
/// final status all the way up the stack.
pub(crate) fn drive_send(stack: &mut Vec<Box<dyn OpData>>, ctx: &mut OpContext) -> DriveResult {
    loop {
        let Some(top) = stack.last_mut() else {
            return DriveResult::StackEmpty;
        };
        match top.send(ctx) {
            OpOutcome::Continue => continue,
            OpOutcome::SendCommand(cmd) => return DriveResult::SendCommand(cmd),
            OpOutcome::Suspend => return DriveResult::Suspend,
            OpOutcome::Push(child) => {
                stack.push(child);
                continue;
            }
            OpOutcome::Done(status) => {
                if let Some(result) = unwind_one(stack, ctx, status) {
                    return result;
                }
                continue;
            }
        }
    }
}

/// Pops the completed top-of-stack operation and feeds its status to the
/// new top's `subcommand_result`, converting that into a `DriveResult` that
/// `drive_send`'s loop can act on, or `None` to keep looping (when the
/// parent's own outcome is `Continue`).
fn unwind_one(stack: &mut Vec<Box<dyn OpData>>, ctx: &mut OpContext, status: OpStatus) -> Option<DriveResult> {
    stack.pop();
    let Some(parent) = stack.last_mut() else {
        return Some(DriveResult::Completed(status));
    };
    match parent.subcommand_result(ctx, status) {
        OpOutcome::Continue => None,
        OpOutcome::SendCommand(cmd) => Some(DriveResult::SendCommand(cmd)),
        OpOutcome::Suspend => Some(DriveResult::Suspend),
        OpOutcome::Push(child) => {
            stack.push(child);
            None
        }
        OpOutcome::Done(parent_status) => unwind_one(stack, ctx, parent_status),
    }
}

/// The result of driving the stack as far as it can go without new input.
pub(crate) enum DriveResult {
    /// A command must be written to the control channel.
    SendCommand(String),
    /// Nothing to send; waiting on a non-reply event.
    Suspend,
    /// The whole stack unwound; this is the final status for the host.
    Completed(OpStatus),
    /// The stack was already empty when driven (idle).
    StackEmpty,
}

/// Delivers `reply` to the top-of-stack operation and drives any further
/// progress it unlocks, mirroring §4.1 "Dispatch".
pub(crate) fn dispatch_reply(stack: &mut Vec<Box<dyn OpData>>, ctx: &mut OpContext, reply: &Reply) -> DriveResult {
    let Some(top) = stack.last_mut() else {
        return DriveResult::StackEmpty;
    };
    match top.parse_response(ctx, reply) {
        OpOutcome::Continue => drive_send(stack, ctx),
        OpOutcome::SendCommand(cmd) => DriveResult::SendCommand(cmd),
        OpOutcome::Suspend => DriveResult::Suspend,
        OpOutcome::Push(child) => {
            stack.push(child);
            drive_send(stack, ctx)
        }
        OpOutcome::Done(status) => match unwind_one(stack, ctx, status) {
            Some(result) => result,
            None => drive_send(stack, ctx),
        },
    }
}
