// SPDX-License-Identifier: MIT

//! Core of a transparent L4/L7 interception proxy: original-destination
//! recovery (C1), a local certificate authority with leaf minting (C2), an
//! HTTPS MITM engine with HTTP/1.1 capture (C3), a transparent dispatcher
//! (C4), and a split domestic/foreign DNS resolver (C5). Binaries (see
//! `src/bin/`) wire these together; the HTTP admin surface and the
//! firewall/iptables rule set itself are external collaborators (spec §1) —
//! this crate only exposes the query/mutation functions the former needs
//! (`admin`) and the trait the latter's original-dst recovery runs behind
//! (`platform`).

pub mod admin;
pub mod ca;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod events;
pub mod geo;
pub mod mitm;
pub mod peek;
pub mod platform;
pub mod relay;
pub mod retry;
pub mod shutdown;
pub mod sniff;
pub mod stats;
pub mod upstream;
