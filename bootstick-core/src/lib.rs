//! The core, UI-agnostic library for the `bootstick` USB preparation utility.
//!
//! `bootstick-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `bootstick`) or a graphical
//! user interface. It decides which devices may be erased, lays out partition
//! tables, formats partitions and deploys a payload onto the device, reporting
//! progress as it goes. The heavy lifting is delegated to the system's own
//! tools (`sfdisk`, `mkfs.*`, `dd`, `xorriso`); this crate sequences them,
//! watches them and cleans up after them.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`platform`]: device snapshots and their discovery.
//! - [`safety`]: the eligibility check run before anything destructive.
//! - [`partition`], [`format`], [`mod@write`] and [`extract`]: the stages.
//! - [`orchestrator`]: the state machine that runs a [`job::WriteJob`] on a
//!   worker thread and streams [`orchestrator::JobEvent`]s back.
//! - [`monitor`]: hotplug notifications as a subscription.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use bootstick_core::config::Config;
//! use bootstick_core::job::{LayoutOptions, Payload, WriteJob};
//! use bootstick_core::orchestrator::{JobEvent, Orchestrator, Services};
//! use bootstick_core::platform::{self, SystemMounts};
//! use std::sync::mpsc;
//!
//! fn main() -> bootstick_core::Result<()> {
//!     let config = Config::load_or_default(None)?;
//!     let devices = platform::get_removable_devices(&config.devices, &SystemMounts)?;
//!     let Some(device) = devices.into_iter().next() else {
//!         return Ok(());
//!     };
//!
//!     let orchestrator = Orchestrator::new(Services::system(&config), config);
//!     let job = WriteJob::new(
//!         device,
//!         Payload::RawImage { image: "path/to/image.img.xz".into() },
//!         LayoutOptions::default(),
//!     );
//!
//!     let (tx, rx) = mpsc::channel();
//!     let handle = orchestrator.submit(job, tx)?;
//!     for event in rx {
//!         match event {
//!             JobEvent::Bytes(p) => println!("{} / {} bytes", p.bytes_written, p.total_bytes),
//!             JobEvent::Finished(report) => println!("finished: {}", report.state),
//!             _ => {}
//!         }
//!     }
//!     handle.join();
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod device;
pub mod digest;
pub mod error;
pub mod extract;
pub mod format;
pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod partition;
pub mod platform;
pub mod process;
pub mod progress;
pub mod safety;
pub mod types;
pub mod write;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind, Result};
