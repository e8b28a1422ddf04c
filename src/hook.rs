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

use capnp::Error;

use std::fmt;
use std::rc::Rc;

use crate::path::Path;

/// The types supplied by the surrounding RPC layer.
///
/// This core never looks inside a `Request` or a `Response`. The only thing it
/// needs from a completed response is the ability to pull out the capability
/// stored at some path.
pub trait Protocol: Sized + 'static {
    /// Payload of a call, carried unmodified through `pipeline()` and `call()`.
    type Request;

    /// A completed result.
    type Response: Clone;

    /// Extracts the capability at `path` from `response`. The returned capability
    /// carries one reference owned by the caller.
    fn get_pipelined_cap(response: &Self::Response, path: &Path) -> Result<Cap<Self>, Error>;
}

/// A reference to a capability.
pub type Cap<P> = Rc<dyn ClientHook<P>>;

/// A reference to a possibly-unresolved call result.
pub type StructRef<P> = Rc<dyn StructHook<P>>;

pub trait ClientHook<P: Protocol> {
    /// Invokes a method on the capability. `caps` is passed through untouched.
    fn call(&self, request: P::Request, caps: &[Cap<P>]) -> StructRef<P>;

    fn inc_ref(&self);

    fn dec_ref(&self);

    /// If this capability is a stand-in that already knows what it points to,
    /// returns that capability. Callers wanting to skip the indirection entirely
    /// should use `shortest()`.
    fn get_resolved(&self) -> Option<Cap<P>>;

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

pub trait StructHook<P: Protocol> {
    /// `None` while the result is still outstanding.
    fn response(&self) -> Option<Result<P::Response, Error>>;

    /// Returns the capability at `path`, with one new reference owned by the caller.
    fn cap(&self, path: &Path) -> Cap<P>;

    /// Arranges for `f` to be called with the final struct reference once this one
    /// resolves. Continuations run in registration order.
    fn when_resolved(&self, f: Box<dyn FnOnce(StructRef<P>)>);

    /// Tells the other side we are no longer interested in the result.
    fn finish(&self);

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<P: Protocol> fmt::Display for dyn ClientHook<P> + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pp(f)
    }
}

impl<P: Protocol> fmt::Display for dyn StructHook<P> + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pp(f)
    }
}
