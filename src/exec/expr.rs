// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Scalar expressions evaluated over abstract rows.
//!
//! Only the shapes the sink and hash table need: slot references that project a
//! column out of a row, and literals. Planning and analysis happen upstream.

use crate::runtime::row_batch::{Datum, Row};

#[derive(Clone, Debug)]
pub enum ScalarExpr {
    SlotRef(usize),
    Literal(Datum),
}

impl ScalarExpr {
    pub fn slot(idx: usize) -> Self {
        ScalarExpr::SlotRef(idx)
    }

    pub fn literal(value: Datum) -> Self {
        ScalarExpr::Literal(value)
    }
}

#[derive(Clone, Debug)]
pub struct ScalarExprEvaluator {
    expr: ScalarExpr,
}

impl ScalarExprEvaluator {
    pub fn new(expr: ScalarExpr) -> Self {
        Self { expr }
    }

    pub fn create_evals(exprs: &[ScalarExpr]) -> Vec<ScalarExprEvaluator> {
        exprs.iter().cloned().map(ScalarExprEvaluator::new).collect()
    }

    pub fn eval(&self, row: &Row) -> Datum {
        match &self.expr {
            ScalarExpr::SlotRef(idx) => {
                debug_assert!(*idx < row.len(), "slot {} out of row width {}", idx, row.len());
                row.get(*idx).cloned().unwrap_or(Datum::Null)
            }
            ScalarExpr::Literal(value) => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ScalarExpr, ScalarExprEvaluator};
    use crate::runtime::row_batch::Datum;

    #[test]
    fn slot_ref_projects_column() {
        let eval = ScalarExprEvaluator::new(ScalarExpr::slot(1));
        let row = vec![Datum::Int(1), Datum::Text("x".to_string())];
        assert_eq!(eval.eval(&row), Datum::Text("x".to_string()));
    }

    #[test]
    fn literal_ignores_row() {
        let eval = ScalarExprEvaluator::new(ScalarExpr::literal(Datum::Int(7)));
        assert_eq!(eval.eval(&vec![]), Datum::Int(7));
    }
}
