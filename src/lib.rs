//! `framewire` is a small general purpose networking library: a threaded
//! TCP/UDP server that spreads stream peers across fixed-size reader groups,
//! decodes framed, type-tagged packets through a user-extensible registry and
//! hands them to the application through a thread-safe FIFO inbox, plus the
//! symmetric client.

pub mod logging;
pub mod net;
