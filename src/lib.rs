//! An asynchronous stub DNS resolver core.
//!
//! This crate implements the scheduling and dispatch engine of a stub
//! resolver: it accepts queries from user space, drives them through
//! retry and timeout cycles across one or more upstream nameservers over
//! UDP, retries truncated responses over TCP, answers selected queries
//! from a static host table, and delivers every result through a
//! user-supplied [`Handler`].
//!
//! The crate deliberately does not resolve recursively, validate DNSSEC
//! or cache: it forwards to the nameservers found in a configuration in
//! the style of `/etc/resolv.conf` the way the platform's own stub
//! resolver would.
//!
//! # Usage
//!
//! A [`Context`] is created from a [`conf::ResolvConf`] and a
//! [`hosts::Hosts`] table together with the [`Core`] engine driving it.
//! The engine is a future that needs to run on a
//! [Tokio](https://tokio.rs/) runtime while queries are outstanding;
//! [`Context::spawn`] takes care of that in one go.
//!
//! ```no_run
//! use std::sync::Arc;
//! use domain::base::iana::Rtype;
//! use domain::base::name::Name;
//! use stub_resolv::{Answer, Context, Handler, Operation};
//!
//! struct Print;
//!
//! impl Handler for Print {
//!     fn on_resolved(&self, _op: &Operation, answer: Answer) {
//!         println!("{} answers", answer.header_counts().ancount());
//!     }
//!     fn on_timeout(&self, _op: &Operation) {
//!         println!("timed out");
//!     }
//! }
//!
//! # async fn example() -> Result<(), stub_resolv::Error> {
//! let (context, core) = Context::system();
//! tokio::spawn(core.run());
//! let name = Name::vec_from_str("example.com").unwrap();
//! let _op = context.query(&name, Rtype::A, Arc::new(Print))?;
//! # Ok(())
//! # }
//! ```
//!
//! Every operation reports exactly once: a matching response arrives as
//! [`Handler::on_received`] (which by default dispatches to
//! [`Handler::on_resolved`] or [`Handler::on_failure`] on the response
//! code), spent attempts without an answer arrive as
//! [`Handler::on_timeout`], and [`Operation::cancel`] reports
//! [`Handler::on_cancelled`] synchronously.

pub mod conf;
pub mod hosts;

mod context;
mod core;
mod error;
mod lookup;
mod net;
mod query;

pub use self::context::{Context, Handler, Operation};
pub use self::core::Core;
pub use self::error::Error;
pub use self::query::{Answer, Bits, Query};
