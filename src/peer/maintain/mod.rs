mod keepalive;
mod recovery;
mod stats;
mod watch;

pub(crate) use keepalive::keepalive_loop;
pub(crate) use recovery::recovery_loop;
pub(crate) use stats::stats_loop;
pub(crate) use watch::{primary_read_loop, transport_watch_loop};
