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
use capnp_pipeline::{local, Cap, ClientHook, Path, PipelineHooks, Protocol, StructProxy, StructRef};

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

pub struct TestProtocol;

#[derive(Clone)]
pub struct TestResponse {
    pub text: String,
    pub caps: Rc<BTreeMap<Path, Rc<CountingCap>>>,
}

impl TestResponse {
    pub fn new(text: &str, caps: Vec<(Path, Rc<CountingCap>)>) -> TestResponse {
        TestResponse {
            text: text.to_string(),
            caps: Rc::new(caps.into_iter().collect()),
        }
    }
}

impl Protocol for TestProtocol {
    type Request = String;
    type Response = TestResponse;

    fn get_pipelined_cap(response: &TestResponse, path: &Path) -> Result<Cap<Self>, Error> {
        match response.caps.get(path) {
            Some(cap) => {
                cap.inc_ref();
                Ok(cap.clone())
            }
            None => Err(Error::failed(format!("no capability at {path}"))),
        }
    }
}

/// A capability that counts the references handed out to it and records its calls.
pub struct CountingCap {
    pub name: String,
    pub refs: Cell<i64>,
    pub calls: RefCell<Vec<String>>,
    // Capabilities placed in the results of every call.
    pub results: RefCell<Vec<(Path, Rc<CountingCap>)>>,
}

impl CountingCap {
    pub fn new(name: &str) -> Rc<CountingCap> {
        Rc::new(CountingCap {
            name: name.to_string(),
            refs: Cell::new(0),
            calls: RefCell::new(Vec::new()),
            results: RefCell::new(Vec::new()),
        })
    }
}

impl ClientHook<TestProtocol> for CountingCap {
    fn call(&self, request: String, _caps: &[Cap<TestProtocol>]) -> StructRef<TestProtocol> {
        self.calls.borrow_mut().push(request.clone());
        let response = TestResponse::new(
            &format!("{}:{}", self.name, request),
            self.results.borrow().clone(),
        );
        local::StructRef::new(Ok(response))
    }

    fn inc_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    fn dec_ref(&self) {
        assert!(self.refs.get() > 0, "{} released too many times", self.name);
        self.refs.set(self.refs.get() - 1);
    }

    fn get_resolved(&self) -> Option<Cap<TestProtocol>> {
        None
    }

    fn pp(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (refs={})", self.name, self.refs.get())
    }
}

pub type Question = StructProxy<TestProtocol, Recorder>;

struct Buffered {
    origin: String,
    path: Path,
    request: String,
    question: Question,
}

/// Hooks standing in for an RPC connection. Pipelined calls are buffered per
/// question and delivered to the real capability when that question resolves.
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Rc<RefCell<Vec<String>>>,
    buffered: Rc<RefCell<Vec<Buffered>>>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder::default()
    }

    pub fn question(&self, name: &str) -> Question {
        StructProxy::new(self.clone(), name.to_string())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.borrow().iter().any(|e| e == event)
    }
}

impl PipelineHooks<TestProtocol> for Recorder {
    type Target = String;

    fn do_pipeline(
        &self,
        target: &String,
        path: &Path,
        request: String,
        _caps: &[Cap<TestProtocol>],
    ) -> StructRef<TestProtocol> {
        self.events
            .borrow_mut()
            .push(format!("pipeline {target}{path} {request}"));
        let question = self.question(&format!("{target}{path}.{request}"));
        self.buffered.borrow_mut().push(Buffered {
            origin: target.clone(),
            path: path.clone(),
            request,
            question: question.clone(),
        });
        question.as_struct_ref()
    }

    fn on_resolve(&self, target: &String, resolved: &StructRef<TestProtocol>) {
        self.events.borrow_mut().push(format!("resolve {target}"));
        let mine: Vec<Buffered> = {
            let mut buffered = self.buffered.borrow_mut();
            let (mine, rest): (Vec<Buffered>, Vec<Buffered>) =
                buffered.drain(..).partition(|b| b.origin == *target);
            *buffered = rest;
            mine
        };
        for b in mine {
            let cap = resolved.cap(&b.path);
            let result = cap.call(b.request, &[]);
            cap.dec_ref();
            b.question.connect(result);
        }
    }

    fn do_finish(&self, target: &String) {
        self.events.borrow_mut().push(format!("finish {target}"));
    }

    fn pp_target(&self, target: &String, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(target)
    }
}

pub fn path(fields: &[u16]) -> Path {
    Path::new(fields.to_vec())
}

pub fn response_text(s: &dyn capnp_pipeline::StructHook<TestProtocol>) -> String {
    match s.response() {
        Some(Ok(r)) => r.text,
        Some(Err(e)) => panic!("unexpected error: {e}"),
        None => panic!("not resolved yet"),
    }
}
