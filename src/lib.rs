// Copyright (c) 2013-2024 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Promise pipelining for [Cap'n Proto](https://capnproto.org/rpc.html#time-travel-promise-pipelining)
//! style capability RPC.
//!
//! A [`StructProxy`] stands for the result of a call that has not returned yet. Asking it
//! for the capability at some [`Path`] gives back a field proxy on which calls can be made
//! right away; they are routed through [`PipelineHooks::do_pipeline()`] until the result
//! arrives and directly to the real capability afterwards.
//!
//! ```ignore
//! let answer = StructProxy::new(question_hooks, question);
//! let calculator = answer.cap(&Path::new(vec![0]));
//! let value = calculator.call(evaluate_request, &[]);
//! // ... later, when the Return message arrives:
//! answer.resolve(Ok(response));
//! ```
//!
//! This crate does no I/O. The transport, the capability tables and method dispatch are
//! supplied by the RPC layer through [`Protocol`] and [`PipelineHooks`].

use capnp::capability::Promise;
use capnp::Error;
use futures::channel::oneshot;
use futures::TryFutureExt;

use std::fmt;

pub use crate::hook::{Cap, ClientHook, Protocol, StructHook, StructRef};
pub use crate::path::Path;
pub use crate::struct_proxy::{PipelineHooks, StructProxy};

pub use crate::field::FieldProxy;

pub mod broken;
mod field;
mod hook;
pub mod local;
mod path;
mod struct_proxy;

/// The error a struct reference reports once it has been finished before its
/// result arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

const CANCELLED_TEXT: &str = "cancelled";

impl Cancelled {
    /// Checks whether `error` was produced from a `Cancelled`.
    ///
    /// Only the kind and text are compared, so a `Failed` error from elsewhere whose
    /// text is exactly `cancelled` (say, relayed from a peer) is reported as a
    /// cancellation too.
    pub fn is(error: &Error) -> bool {
        error.kind == capnp::ErrorKind::Failed && error.extra == CANCELLED_TEXT
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(CANCELLED_TEXT)
    }
}

impl std::error::Error for Cancelled {}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Error {
        Error::failed(CANCELLED_TEXT.to_string())
    }
}

/// Returns a promise for the struct reference that `s` eventually resolves to.
///
/// If `s` is torn down first, its pending continuations are dropped and the promise
/// fails with [`Cancelled`].
pub fn when_resolved_promise<P: Protocol>(s: &dyn StructHook<P>) -> Promise<StructRef<P>, Error> {
    let (tx, rx) = oneshot::channel();
    s.when_resolved(Box::new(move |resolved| {
        let _ = tx.send(resolved);
    }));
    Promise::from_future(rx.map_err(canceled_to_error))
}

/// Follows forwarded stand-ins until reaching a capability that has nothing
/// further to redirect to.
pub fn shortest<P: Protocol>(cap: &Cap<P>) -> Cap<P> {
    let mut cap = cap.clone();
    while let Some(next) = cap.get_resolved() {
        cap = next;
    }
    cap
}

fn canceled_to_error(_e: oneshot::Canceled) -> Error {
    Cancelled.into()
}
