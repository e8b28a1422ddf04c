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

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::hook::{Cap, ClientHook, Protocol, StructHook};
use crate::path::Path;

pub struct StructRef<P> {
    error: Error,
    finished: Cell<bool>,
    marker: PhantomData<P>,
}

impl<P: Protocol> StructRef<P> {
    pub fn new(error: Error) -> StructRef<P> {
        StructRef {
            error,
            finished: Cell::new(false),
            marker: PhantomData,
        }
    }
}

impl<P: Protocol> StructHook<P> for StructRef<P> {
    fn response(&self) -> Option<Result<P::Response, Error>> {
        Some(Err(self.error.clone()))
    }

    fn cap(&self, _path: &Path) -> Cap<P> {
        new_cap(self.error.clone())
    }

    fn when_resolved(&self, f: Box<dyn FnOnce(crate::hook::StructRef<P>)>) {
        f(new_struct_ref(self.error.clone()))
    }

    fn finish(&self) {
        if self.finished.replace(true) {
            panic!("finish: already finished");
        }
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broken struct ({})", self.error)
    }
}

pub struct Client<P> {
    error: Error,
    marker: PhantomData<P>,
}

impl<P: Protocol> Client<P> {
    pub fn new(error: Error) -> Client<P> {
        Client {
            error,
            marker: PhantomData,
        }
    }
}

impl<P: Protocol> ClientHook<P> for Client<P> {
    fn call(&self, _request: P::Request, _caps: &[Cap<P>]) -> crate::hook::StructRef<P> {
        new_struct_ref(self.error.clone())
    }

    fn inc_ref(&self) {}

    fn dec_ref(&self) {}

    fn get_resolved(&self) -> Option<Cap<P>> {
        None
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broken cap ({})", self.error)
    }
}

pub fn new_cap<P: Protocol>(error: Error) -> Cap<P> {
    Rc::new(Client::new(error))
}

pub fn new_struct_ref<P: Protocol>(error: Error) -> crate::hook::StructRef<P> {
    Rc::new(StructRef::new(error))
}

#[cfg(test)]
mod test {
    use super::StructRef;
    use crate::hook::{Cap, Protocol, StructHook};
    use crate::path::Path;
    use capnp::Error;

    struct NoCaps;

    impl Protocol for NoCaps {
        type Request = ();
        type Response = ();

        fn get_pipelined_cap(_response: &(), path: &Path) -> Result<Cap<Self>, Error> {
            Err(Error::failed(format!("no capability at {path}")))
        }
    }

    #[test]
    fn caps_carry_the_error() {
        let s = StructRef::<NoCaps>::new(Error::failed("gone".to_string()));
        let cap = s.cap(&Path::new(vec![3]));
        match cap.call((), &[]).response() {
            Some(Err(e)) => assert_eq!(e.extra, "gone"),
            _ => panic!("expected an error"),
        }
    }

    #[test]
    #[should_panic(expected = "finish: already finished")]
    fn double_finish() {
        let s = StructRef::<NoCaps>::new(Error::failed("gone".to_string()));
        s.finish();
        s.finish();
    }
}
