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

//! The promise side of pipelining: a struct reference that may be asked for
//! capabilities at its fields before its result exists.

use capnp::Error;

use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use crate::field::{FieldOwner, FieldProxy};
use crate::hook::{Cap, Protocol, StructHook, StructRef};
use crate::path::Path;
use crate::{local, Cancelled};

/// What the RPC layer does with the not-yet-resolved value behind a
/// [`StructProxy`].
pub trait PipelineHooks<P: Protocol> {
    /// Whatever the RPC layer knows about the call before it returns,
    /// e.g. an outstanding question.
    type Target;

    /// Sends `request` to the capability that will appear at `path` of the result.
    fn do_pipeline(
        &self,
        target: &Self::Target,
        path: &Path,
        request: P::Request,
        caps: &[Cap<P>],
    ) -> StructRef<P>;

    /// Called once the result is known, before any `when_resolved` continuation runs.
    fn on_resolve(&self, target: &Self::Target, resolved: &StructRef<P>);

    /// Releases `target` after a cancellation that nothing is waiting on anymore.
    fn do_finish(&self, target: &Self::Target);

    fn pp_target(&self, _target: &Self::Target, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("?")
    }
}

struct Field<P: Protocol> {
    cap: Rc<FieldProxy<P>>,
    // One unit belongs to the map itself.
    ref_count: usize,
}

struct Unresolved<P: Protocol, T> {
    target: Rc<T>,
    fields: BTreeMap<Path, Field<P>>,
    when_resolved: VecDeque<Box<dyn FnOnce(StructRef<P>)>>,
    cancelling: bool,
}

enum State<P: Protocol, T> {
    Unresolved(Unresolved<P, T>),
    Forwarding(StructRef<P>),
    Finished,
}

enum Branch<'a, P: Protocol, T> {
    Unresolved(RefMut<'a, Unresolved<P, T>>),
    Forwarding(StructRef<P>),
}

struct StructProxyInner<P: Protocol, H: PipelineHooks<P>> {
    hooks: H,
    state: RefCell<State<P, H::Target>>,
    me: Weak<StructProxyInner<P, H>>,
}

/// A struct reference that starts out unresolved and is later connected to the
/// real result with [`connect()`](StructProxy::connect) or
/// [`resolve()`](StructProxy::resolve).
///
/// Capabilities requested with `cap()` before then are [`FieldProxy`]s. Calls made
/// on them are pipelined through `PipelineHooks::do_pipeline()` and, once the
/// result arrives, each proxy is switched over to the matching capability of the
/// result with its reference count carried across.
///
/// Misuse (operating on a finished reference, connecting twice, asking for new
/// fields after `finish()`) panics.
pub struct StructProxy<P: Protocol, H: PipelineHooks<P>> {
    inner: Rc<StructProxyInner<P, H>>,
}

impl<P: Protocol, H: PipelineHooks<P>> Clone for StructProxy<P, H> {
    fn clone(&self) -> Self {
        StructProxy {
            inner: self.inner.clone(),
        }
    }
}

impl<P, H> StructProxy<P, H>
where
    P: Protocol,
    H: PipelineHooks<P> + 'static,
{
    pub fn new(hooks: H, target: H::Target) -> Self {
        let inner = Rc::new_cyclic(|me| StructProxyInner {
            hooks,
            state: RefCell::new(State::Unresolved(Unresolved {
                target: Rc::new(target),
                fields: BTreeMap::new(),
                when_resolved: VecDeque::new(),
                cancelling: false,
            })),
            me: me.clone(),
        });
        StructProxy { inner }
    }

    pub fn as_struct_ref(&self) -> StructRef<P> {
        Rc::new(self.clone())
    }

    /// Makes a call on the capability at `path` of the result.
    pub fn pipeline(&self, path: &Path, request: P::Request, caps: &[Cap<P>]) -> StructRef<P> {
        self.inner.pipeline(path, request, caps)
    }

    /// Resolves to the struct reference `target`.
    pub fn connect(&self, target: StructRef<P>) {
        self.inner.connect(target)
    }

    /// Resolves to a result that is already in hand.
    pub fn resolve(&self, result: Result<P::Response, Error>) {
        self.inner.connect(local::StructRef::new(result))
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.inner.state.borrow(), State::Unresolved(_))
    }

    /// True once `finish()` has been called, whether teardown is still waiting on
    /// pipelined fields or has completed. A reference finished after resolving also
    /// counts, since it is `Finished` either way.
    pub fn is_cancelling(&self) -> bool {
        match *self.inner.state.borrow() {
            State::Unresolved(ref u) => u.cancelling,
            State::Forwarding(_) => false,
            State::Finished => true,
        }
    }

    /// Panics if the field bookkeeping is inconsistent.
    pub fn check_invariants(&self) {
        if let State::Unresolved(ref u) = *self.inner.state.borrow() {
            let me = self.inner.me.clone() as Weak<dyn FieldOwner<P>>;
            for (path, field) in &u.fields {
                assert!(
                    field.ref_count > 1,
                    "field {path} held only by its map (ref_count = {})",
                    field.ref_count
                );
                assert!(
                    field.cap.is_owned_by(&me),
                    "field {path} does not point back at its struct reference"
                );
            }
            assert!(
                !(u.cancelling && u.fields.is_empty()),
                "cancelled struct reference was not torn down"
            );
        }
    }
}

impl<P, H> StructProxyInner<P, H>
where
    P: Protocol,
    H: PipelineHooks<P> + 'static,
{
    // Every operation goes through here. Finished rejects everything; a cancelling
    // reference only accepts operations that outstanding holders may still need.
    fn dispatch(&self, op: &str, cancelling_ok: bool) -> Branch<'_, P, H::Target> {
        let state = self.state.borrow_mut();
        match *state {
            State::Finished => panic!("{op}: already finished"),
            State::Unresolved(ref u) if u.cancelling && !cancelling_ok => {
                panic!("{op}: already finished")
            }
            State::Forwarding(ref x) => return Branch::Forwarding(x.clone()),
            State::Unresolved(_) => (),
        }
        Branch::Unresolved(RefMut::map(state, |s| match s {
            State::Unresolved(u) => u,
            _ => unreachable!(),
        }))
    }

    fn cap(&self, path: &Path) -> Cap<P> {
        match self.dispatch("cap", false) {
            Branch::Unresolved(mut u) => {
                let field = u.fields.entry(path.clone()).or_insert_with(|| {
                    log::trace!("new pipelined field {path}");
                    Field {
                        cap: Rc::new(FieldProxy::new(
                            self.me.clone() as Weak<dyn FieldOwner<P>>,
                            path.clone(),
                        )),
                        ref_count: 1,
                    }
                });
                field.ref_count += 1;
                let cap: Cap<P> = field.cap.clone();
                cap
            }
            Branch::Forwarding(x) => x.cap(path),
        }
    }

    fn connect(&self, target: StructRef<P>) {
        match self.dispatch("connect", true) {
            Branch::Unresolved(u) => drop(u),
            Branch::Forwarding(_) => panic!("connect: already forwarding"),
        }
        let old = mem::replace(
            &mut *self.state.borrow_mut(),
            State::Forwarding(target.clone()),
        );
        let State::Unresolved(u) = old else {
            unreachable!()
        };
        log::debug!("struct reference resolved to {target}");

        for (path, field) in u.fields {
            if field.ref_count > 1 {
                let cap = target.cap(&path);
                field.cap.resolve(cap.clone());
                // The map's own unit goes away; the one from `cap()` now belongs
                // to the proxy. Everyone else gets a reference of their own.
                for _ in 0..field.ref_count - 2 {
                    cap.inc_ref();
                }
            }
        }

        self.hooks.on_resolve(&u.target, &target);

        for f in u.when_resolved {
            f(target.clone());
        }

        // A continuation may already have finished us.
        if u.cancelling && matches!(*self.state.borrow(), State::Forwarding(_)) {
            self.finish();
        }
    }

    fn finish(&self) {
        match self.dispatch("finish", false) {
            Branch::Unresolved(mut u) => {
                u.cancelling = true;
                if u.fields.is_empty() {
                    drop(u);
                    self.tear_down();
                } else {
                    log::debug!(
                        "finish deferred until {} pipelined field(s) are released",
                        u.fields.len()
                    );
                }
            }
            Branch::Forwarding(x) => {
                *self.state.borrow_mut() = State::Finished;
                x.finish();
            }
        }
    }

    // Cancellation completed with nothing left holding a field.
    fn tear_down(&self) {
        let old = mem::replace(&mut *self.state.borrow_mut(), State::Finished);
        let State::Unresolved(u) = old else {
            unreachable!()
        };
        if !u.when_resolved.is_empty() {
            log::debug!(
                "dropping {} when_resolved continuation(s) of a cancelled struct reference",
                u.when_resolved.len()
            );
        }
        log::debug!("releasing cancelled struct reference");
        self.hooks.do_finish(&u.target);
    }

    fn when_resolved(&self, f: Box<dyn FnOnce(StructRef<P>)>) {
        match self.dispatch("when_resolved", false) {
            Branch::Unresolved(mut u) => u.when_resolved.push_back(f),
            Branch::Forwarding(x) => x.when_resolved(f),
        }
    }

    fn response(&self) -> Option<Result<P::Response, Error>> {
        let x = match *self.state.borrow() {
            State::Unresolved(ref u) if !u.cancelling => return None,
            State::Unresolved(_) | State::Finished => return Some(Err(Cancelled.into())),
            State::Forwarding(ref x) => x.clone(),
        };
        x.response()
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.try_borrow() {
            Ok(state) => state,
            Err(_) => return f.write_str("struct proxy (busy)"),
        };
        match *state {
            State::Unresolved(ref u) => {
                f.write_str("unresolved(")?;
                self.hooks.pp_target(&u.target, f)?;
                if u.cancelling {
                    f.write_str(", cancelling")?;
                }
                f.write_str(") fields:[")?;
                for (i, (path, field)) in u.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{path} rc={}", field.ref_count)?;
                }
                f.write_str("]")
            }
            State::Forwarding(ref x) => write!(f, "forwarding -> {x}"),
            State::Finished => f.write_str("finished"),
        }
    }
}

impl<P, H> FieldOwner<P> for StructProxyInner<P, H>
where
    P: Protocol,
    H: PipelineHooks<P> + 'static,
{
    fn pipeline(&self, path: &Path, request: P::Request, caps: &[Cap<P>]) -> StructRef<P> {
        match self.dispatch("pipeline", true) {
            Branch::Unresolved(u) => {
                let target = u.target.clone();
                drop(u);
                self.hooks.do_pipeline(&target, path, request, caps)
            }
            Branch::Forwarding(x) => {
                let cap = x.cap(path);
                let result = cap.call(request, caps);
                cap.dec_ref();
                result
            }
        }
    }

    fn field_inc_ref(&self, path: &Path) {
        match self.dispatch("inc_ref", true) {
            Branch::Unresolved(mut u) => {
                let field = match u.fields.get_mut(path) {
                    Some(field) => field,
                    None => panic!("inc_ref: no field at {path}"),
                };
                assert!(field.ref_count > 1, "inc_ref: field {path} has no holders");
                field.ref_count += 1;
                log::trace!("field {path} ref_count -> {}", field.ref_count);
            }
            Branch::Forwarding(x) => {
                let cap = x.cap(path);
                cap.inc_ref();
                cap.dec_ref();
            }
        }
    }

    fn field_dec_ref(&self, path: &Path) {
        match self.dispatch("dec_ref", true) {
            Branch::Unresolved(mut u) => {
                let field = match u.fields.get_mut(path) {
                    Some(field) => field,
                    None => panic!("dec_ref: no field at {path}"),
                };
                assert!(field.ref_count > 1, "dec_ref: field {path} has no holders");
                field.ref_count -= 1;
                log::trace!("field {path} ref_count -> {}", field.ref_count);
                if field.ref_count == 1 {
                    u.fields.remove(path);
                    if u.cancelling && u.fields.is_empty() {
                        drop(u);
                        self.tear_down();
                    }
                }
            }
            Branch::Forwarding(x) => {
                let cap = x.cap(path);
                cap.dec_ref();
                cap.dec_ref();
            }
        }
    }

    fn field_pp(&self, path: &Path, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field {path} of ")?;
        self.pp(f)
    }
}

impl<P, H> StructHook<P> for StructProxy<P, H>
where
    P: Protocol,
    H: PipelineHooks<P> + 'static,
{
    fn response(&self) -> Option<Result<P::Response, Error>> {
        self.inner.response()
    }

    fn cap(&self, path: &Path) -> Cap<P> {
        self.inner.cap(path)
    }

    fn when_resolved(&self, f: Box<dyn FnOnce(StructRef<P>)>) {
        self.inner.when_resolved(f)
    }

    fn finish(&self) {
        self.inner.finish()
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.pp(f)
    }
}

impl<P, H> fmt::Display for StructProxy<P, H>
where
    P: Protocol,
    H: PipelineHooks<P> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.pp(f)
    }
}
