//! Concrete `Command`/`Task` implementations. The core (`task`, `command`,
//! `queue`, `runner`) never depends on anything in this module; commands
//! depend on the core, not the reverse.

pub mod http_search;
