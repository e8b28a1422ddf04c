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

use capnp::private::capability::PipelineOp;

use std::fmt;

/// Location of a capability inside a call result: the sequence of pointer-field
/// indices to follow from the root struct.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(Vec<u16>);

impl Path {
    pub fn root() -> Path {
        Path(Vec::new())
    }

    pub fn new(fields: Vec<u16>) -> Path {
        Path(fields)
    }

    /// Returns a new path that descends one pointer field further.
    pub fn field(&self, index: u16) -> Path {
        let mut fields = self.0.clone();
        fields.push(index);
        Path(fields)
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_pipeline_ops(&self) -> Vec<PipelineOp> {
        self.0.iter().map(|&i| PipelineOp::GetPointerField(i)).collect()
    }
}

impl From<&[PipelineOp]> for Path {
    fn from(ops: &[PipelineOp]) -> Path {
        let fields = ops
            .iter()
            .filter_map(|op| match *op {
                PipelineOp::Noop => None,
                PipelineOp::GetPointerField(i) => Some(i),
            })
            .collect();
        Path(fields)
    }
}

impl From<Vec<u16>> for Path {
    fn from(fields: Vec<u16>) -> Path {
        Path(fields)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for i in &self.0 {
            write!(f, "/{i}")?;
        }
        Ok(())
    }
}
