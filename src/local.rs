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
use std::rc::{Rc, Weak};

use crate::broken;
use crate::hook::{Cap, Protocol, StructHook};
use crate::path::Path;

/// A struct reference whose result is already known.
pub struct StructRef<P: Protocol> {
    // Becomes `None` once finished.
    result: RefCell<Option<Result<P::Response, Error>>>,
    me: Weak<StructRef<P>>,
}

impl<P: Protocol> StructRef<P> {
    pub fn new(result: Result<P::Response, Error>) -> Rc<StructRef<P>> {
        Rc::new_cyclic(|me| StructRef {
            result: RefCell::new(Some(result)),
            me: me.clone(),
        })
    }

    fn with_result<R>(&self, op: &str, f: impl FnOnce(&Result<P::Response, Error>) -> R) -> R {
        match *self.result.borrow() {
            Some(ref result) => f(result),
            None => panic!("{op}: already finished"),
        }
    }
}

impl<P: Protocol> StructHook<P> for StructRef<P> {
    fn response(&self) -> Option<Result<P::Response, Error>> {
        Some(self.with_result("response", Clone::clone))
    }

    fn cap(&self, path: &Path) -> Cap<P> {
        self.with_result("cap", |result| match result {
            Ok(response) => match P::get_pipelined_cap(response, path) {
                Ok(cap) => cap,
                Err(e) => broken::new_cap(e),
            },
            Err(e) => broken::new_cap(e.clone()),
        })
    }

    fn when_resolved(&self, f: Box<dyn FnOnce(crate::hook::StructRef<P>)>) {
        self.with_result("when_resolved", |_| ());
        if let Some(me) = self.me.upgrade() {
            let me: crate::hook::StructRef<P> = me;
            f(me)
        }
    }

    fn finish(&self) {
        let result = self.result.borrow_mut().take();
        if result.is_none() {
            panic!("finish: already finished");
        }
        // Dropping the response releases whatever it holds.
        drop(result);
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.result.try_borrow() {
            Ok(r) => match *r {
                Some(Ok(_)) => f.write_str("resolved"),
                Some(Err(ref e)) => write!(f, "resolved to error ({e})"),
                None => f.write_str("finished"),
            },
            Err(_) => f.write_str("resolved (busy)"),
        }
    }
}
