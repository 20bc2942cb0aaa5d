//! The `List` operation (§4.4), grounded on `original_source/.../list.cpp`
//! and `directorycache.h`.
//!
//! Confirms the target directory via `ChangeDir`, acquires the per-path
//! `List` lock so concurrent listers on the same directory serialize rather
//! than issue redundant `LIST`/`MLSD` commands, serves a fresh non-unsure
//! cache entry without touching the network, and otherwise pushes a
//! `RawTransfer` to fetch and parse a new one. On the first listing for a
//! server whose capabilities don't already pin a timezone (MLSD/MLST force
//! UTC), an `MDTM` probe against the first dated entry estimates the
//! server's timezone offset by comparing its minute-precision `LIST` mtime
//! against `MDTM`'s second-precision UTC value.

use crate::caches::capabilities::Tri;
use crate::caches::locks::LockKind;
use crate::control::change_dir::ChangeDirOp;
use crate::control::raw_transfer::RawTransferOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::directory_listing::{DirectoryListing, ListingParser, MlsdListingParser, UnixListingParser};
use crate::notification::Notification;
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;
use crate::transfer_socket::TransferMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    WaitLock,
    Transfer,
    Mdtm,
}

/// Fetches (or serves from cache) the listing of `path`.
pub struct ListOp {
    state: State,
    path: ServerPath,
    lock_guard: Option<crate::caches::locks::LockGuard>,
    mdtm_name: Option<String>,
    mdtm_list_mtime: Option<chrono::DateTime<chrono::Utc>>,
    listing: Option<DirectoryListing>,
}

impl ListOp {
    /// Builds a `List` op targeting `path`.
    pub fn new(path: ServerPath) -> Self {
        ListOp {
            state: State::Init,
            path,
            lock_guard: None,
            mdtm_name: None,
            mdtm_list_mtime: None,
            listing: None,
        }
    }

    fn select_command_and_parser(&self, ctx: &OpContext) -> (String, Box<dyn ListingParser>) {
        let caps = ctx.shared.capabilities.snapshot(&ctx.server);
        if caps.mlsd.is_yes() {
            ("MLSD".to_string(), Box::new(MlsdListingParser::new()))
        } else if caps.list_dash_a == Tri::No {
            ("LIST".to_string(), Box::new(UnixListingParser::new()))
        } else {
            ("LIST -a".to_string(), Box::new(UnixListingParser::new()))
        }
    }

    fn finish_with_listing(&mut self, ctx: &mut OpContext, listing: DirectoryListing) -> OpOutcome {
        ctx.shared.directory_cache.store(&ctx.server, listing.clone());
        ctx.pending_notifications.push(Notification::DirectoryListingChanged {
            path: self.path.clone(),
            listing: Some(listing.clone()),
        });

        let caps = ctx.shared.capabilities.snapshot(&ctx.server);
        if caps.timezone_offset_minutes.is_none() {
            if let Some(entry) = listing.entries.iter().find(|e| e.mtime.is_some()) {
                self.mdtm_name = Some(entry.name.clone());
                self.mdtm_list_mtime = entry.mtime;
                self.listing = Some(listing);
                self.state = State::Mdtm;
                return OpOutcome::Continue;
            }
        }
        OpOutcome::Done(OpStatus::OK)
    }
}

impl OpData for ListOp {
    fn name(&self) -> &'static str {
        "list"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => OpOutcome::Push(Box::new(ChangeDirOp::to(self.path.clone()))),
            State::WaitLock => {
                if self.lock_guard.is_none() {
                    if let Some(guard) = ctx.held_lock.take() {
                        self.lock_guard = Some(guard);
                    } else {
                        ctx.pending_lock = Some((self.path.clone(), LockKind::List));
                        return OpOutcome::Suspend;
                    }
                }
                if let Some(cached) = ctx.shared.directory_cache.lookup(&ctx.server, &self.path) {
                    if !cached.is_unsure() {
                        self.lock_guard = None; // release before finishing
                        return self.finish_with_listing(ctx, cached);
                    }
                }
                self.state = State::Transfer;
                OpOutcome::Continue
            }
            State::Transfer => {
                let (command, parser) = self.select_command_and_parser(ctx);
                self.lock_guard = None; // drop the advisory lock once the fetch is underway
                OpOutcome::Push(Box::new(RawTransferOp::new(command, TransferMode::List(parser), true, 0)))
            }
            State::Mdtm => {
                let name = self.mdtm_name.clone().expect("Mdtm state implies a pending name");
                OpOutcome::SendCommand(format!("MDTM {}", self.path.format_filename(&name, true)))
            }
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        match self.state {
            State::Mdtm => {
                if reply.class() == 2 {
                    if let (Some(server_utc), Some(list_mtime)) = (parse_mdtm_reply(reply.last_line()), self.mdtm_list_mtime) {
                        let offset = estimate_timezone_offset_minutes(list_mtime, server_utc);
                        ctx.shared.capabilities.with(&ctx.server, |c| c.timezone_offset_minutes = Some(offset));
                    }
                } else {
                    // Best-effort; pin to UTC so we stop probing every listing.
                    ctx.shared.capabilities.with(&ctx.server, |c| c.timezone_offset_minutes.get_or_insert(0));
                }
                OpOutcome::Done(OpStatus::OK)
            }
            State::Init | State::WaitLock | State::Transfer => OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL),
        }
    }

    fn subcommand_result(&mut self, ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        match self.state {
            State::Init => {
                if result.is_ok() {
                    self.state = State::WaitLock;
                    OpOutcome::Continue
                } else {
                    OpOutcome::Done(result)
                }
            }
            State::Transfer => {
                let Some(transfer) = ctx.last_transfer_result.take() else {
                    return OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL);
                };
                if !result.is_ok() {
                    return OpOutcome::Done(result);
                }
                let entries = transfer.listing_entries.unwrap_or_default();
                let listing = DirectoryListing {
                    path: self.path.clone(),
                    entries,
                    first_list_time: chrono::Utc::now(),
                    unsure_flags: crate::directory_listing::UnsureFlags::empty(),
                };
                self.finish_with_listing(ctx, listing)
            }
            _ => OpOutcome::Done(result),
        }
    }
}

fn parse_mdtm_reply(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let digits = text.split_whitespace().next()?;
    let s = digits.split('.').next().unwrap_or(digits);
    if s.len() < 14 {
        return None;
    }
    chrono::NaiveDateTime::parse_from_str(&s[..14], "%Y%m%d%H%M%S")
        .ok()
        .map(|ndt| chrono::DateTime::from_naive_utc_and_offset(ndt, chrono::Utc))
}

/// Rounds the `LIST`-derived local time against the `MDTM` UTC time to the
/// nearest 15 minutes, since `LIST` output only carries minute precision and
/// most timezone offsets are quarter-hour multiples.
fn estimate_timezone_offset_minutes(list_local: chrono::DateTime<chrono::Utc>, mdtm_utc: chrono::DateTime<chrono::Utc>) -> i32 {
    let diff_minutes = (list_local - mdtm_utc).num_minutes();
    let rounded = ((diff_minutes as f64) / 15.0).round() as i64 * 15;
    rounded.clamp(-14 * 60, 14 * 60) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::EngineShared;
    use crate::options::EngineOptions;
    use crate::server_info::{Credentials, Protocol, Server, ServerType};

    fn ctx() -> OpContext {
        OpContext::new(EngineShared::default(), Server::new("example.com", 21, Protocol::Ftp), Credentials::anonymous(), EngineOptions::default())
    }

    #[tokio::test]
    async fn cache_hit_skips_network_and_emits_notification() {
        let path = ServerPath::parse("/pub", ServerType::Default).unwrap();
        let mut c = ctx();
        let listing = DirectoryListing::empty(path.clone(), chrono::Utc::now());
        c.shared.directory_cache.store(&c.server, listing.clone());
        c.shared.capabilities.with(&c.server, |caps| caps.timezone_offset_minutes = Some(0));
        c.held_lock = Some(c.shared.locks.acquire(&c.server, &path, LockKind::List).await);

        let mut op = ListOp::new(path);
        op.state = State::WaitLock;
        let outcome = op.send(&mut c);
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
        assert_eq!(c.pending_notifications.len(), 1);
    }

    #[test]
    fn selects_mlsd_when_advertised() {
        let path = ServerPath::parse("/pub", ServerType::Default).unwrap();
        let mut c = ctx();
        c.shared.capabilities.with(&c.server, |caps| caps.mlsd = Tri::Yes);
        let op = ListOp::new(path);
        let (command, _) = op.select_command_and_parser(&c);
        assert_eq!(command, "MLSD");
    }

    #[test]
    fn degrades_to_plain_list_once_dash_a_known_unsupported() {
        let path = ServerPath::parse("/pub", ServerType::Default).unwrap();
        let mut c = ctx();
        c.shared.capabilities.with(&c.server, |caps| caps.list_dash_a = Tri::No);
        let op = ListOp::new(path);
        let (command, _) = op.select_command_and_parser(&c);
        assert_eq!(command, "LIST");
    }

    #[test]
    fn mdtm_reply_parses_utc_timestamp() {
        let dt = parse_mdtm_reply("20230615120000").unwrap();
        assert_eq!(dt.to_string(), "2023-06-15 12:00:00 UTC");
    }

    #[test]
    fn timezone_offset_rounds_to_quarter_hour() {
        use chrono::TimeZone;
        let list_local = chrono::Utc.with_ymd_and_hms(2023, 6, 15, 14, 0, 0).unwrap();
        let mdtm_utc = chrono::Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(estimate_timezone_offset_minutes(list_local, mdtm_utc), 120);
    }
}
