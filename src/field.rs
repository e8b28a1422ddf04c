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

use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

use crate::broken;
use crate::hook::{Cap, ClientHook, Protocol, StructRef};
use crate::path::Path;

/// The calls a pending field proxy makes back into the struct reference that owns it.
pub(crate) trait FieldOwner<P: Protocol> {
    fn pipeline(&self, path: &Path, request: P::Request, caps: &[Cap<P>]) -> StructRef<P>;
    fn field_inc_ref(&self, path: &Path);
    fn field_dec_ref(&self, path: &Path);
    fn field_pp(&self, path: &Path, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

enum State<P: Protocol> {
    Pending {
        // Non-owning: the struct reference is kept alive by whoever issued the call.
        owner: Weak<dyn FieldOwner<P>>,
        path: Path,
    },
    Forwarded(Cap<P>),
}

/// Stand-in for the capability at one path of an unresolved struct reference.
pub struct FieldProxy<P: Protocol> {
    state: RefCell<State<P>>,
}

// What an operation on the proxy should be applied to, read out of `state` so
// that no borrow is held while calling elsewhere.
enum Route<P: Protocol> {
    Owner(Weak<dyn FieldOwner<P>>, Path),
    Target(Cap<P>),
}

impl<P: Protocol> FieldProxy<P> {
    pub(crate) fn new(owner: Weak<dyn FieldOwner<P>>, path: Path) -> FieldProxy<P> {
        FieldProxy {
            state: RefCell::new(State::Pending { owner, path }),
        }
    }

    /// Switches the proxy over to `target`, taking ownership of one reference on it.
    pub(crate) fn resolve(&self, target: Cap<P>) {
        let mut state = self.state.borrow_mut();
        if let State::Forwarded(_) = *state {
            panic!("field proxy already resolved");
        }
        *state = State::Forwarded(target);
    }

    pub(crate) fn is_owned_by(&self, owner: &Weak<dyn FieldOwner<P>>) -> bool {
        match *self.state.borrow() {
            State::Pending { owner: ref o, .. } => Weak::ptr_eq(o, owner),
            State::Forwarded(_) => false,
        }
    }

    fn route(&self) -> Route<P> {
        match *self.state.borrow() {
            State::Pending {
                ref owner,
                ref path,
            } => Route::Owner(owner.clone(), path.clone()),
            State::Forwarded(ref target) => Route::Target(target.clone()),
        }
    }
}

impl<P: Protocol> ClientHook<P> for FieldProxy<P> {
    fn call(&self, request: P::Request, caps: &[Cap<P>]) -> StructRef<P> {
        match self.route() {
            Route::Owner(owner, path) => match owner.upgrade() {
                Some(owner) => owner.pipeline(&path, request, caps),
                None => broken::new_struct_ref(Error::failed(format!(
                    "pipelined call on field {path} after its struct reference was dropped"
                ))),
            },
            Route::Target(target) => target.call(request, caps),
        }
    }

    fn inc_ref(&self) {
        match self.route() {
            Route::Owner(owner, path) => match owner.upgrade() {
                Some(owner) => owner.field_inc_ref(&path),
                None => log::warn!("inc_ref on field {path} of a dropped struct reference"),
            },
            Route::Target(target) => target.inc_ref(),
        }
    }

    fn dec_ref(&self) {
        match self.route() {
            Route::Owner(owner, path) => match owner.upgrade() {
                Some(owner) => owner.field_dec_ref(&path),
                None => log::warn!("dec_ref on field {path} of a dropped struct reference"),
            },
            Route::Target(target) => target.dec_ref(),
        }
    }

    fn get_resolved(&self) -> Option<Cap<P>> {
        match *self.state.borrow() {
            State::Forwarded(ref target) => Some(target.clone()),
            State::Pending { .. } => None,
        }
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.route() {
            Route::Owner(owner, path) => match owner.upgrade() {
                Some(owner) => owner.field_pp(&path, f),
                None => write!(f, "field {path} (owner dropped)"),
            },
            Route::Target(target) => write!(f, "field -> {target}"),
        }
    }
}
