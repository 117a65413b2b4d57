//! Server output demultiplexing.
//!
//! The supervised server writes free-form log text and framed events to the
//! same stdout pipe. This module separates the two and routes events to
//! handlers keyed by event type.
//!
//! # Components
//!
//! * `frame` - Chunk-boundary independent marker framing
//! * `archive` - Pipe reading, body parsing, listener broadcast, line history
//! * `dispatcher` - Event type to handler registry
//! * `event` - Event records and the built-in event payloads
mod archive;
mod dispatcher;
mod event;
pub mod frame;

pub use archive::{OutputKind, OutputLine, OutputListener, ProcessOutputArchive};
pub use dispatcher::{HandlerRegistry, StreamEventHandler};
pub use event::{BROWSER_EVENT, BrowserEvent, CONFIG_EVENT, EventRecord, PORT_EVENT, PortEvent};
