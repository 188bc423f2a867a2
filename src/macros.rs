//! Macro expansion of compound probabilistic forms.
//!
//! `SIMULATE ... FROM MODELS OF p` can only hand primitive quantities to the
//! backend. Compound columns are split here into an inner simulation of the
//! primitives and an outer SELECT that recombines them. `PROBABILITY OF (e)`
//! becomes the average of `e` over simulated models.

use crate::ast::{BqlFn, Expr, FromItem, Query, Select, SelectColumn, SimulateModels};
use crate::error::{BqlError, Result};

/// Column name given to each lifted primitive.
pub const SIM_COLUMN_PREFIX: &str = "_bql_sim_";

/// Column that `PROBABILITY OF` averages over.
pub const ESTIMATE_COLUMN: &str = "x";

fn is_primitive(expr: &Expr) -> bool {
    match expr {
        Expr::Col { .. } => true,
        Expr::Bql(f) => !matches!(**f, BqlFn::ProbEstimate(_)),
        _ => false,
    }
}

/// Rewrites a `SIMULATE ... FROM MODELS OF` whose columns may be compound.
pub fn expand_simulate_models(simulate: &SimulateModels) -> Result<Query> {
    let mut compound = false;
    for column in &simulate.columns {
        match column {
            SelectColumn::Exp { expr, .. } => compound |= !is_primitive(expr),
            _ => {
                return Err(BqlError::compile(
                    "SIMULATE ... FROM MODELS OF needs explicit columns, not *",
                ));
            }
        }
    }
    if !compound {
        return Ok(Query::SimulateModels(simulate.clone()));
    }

    let mut lifter = Lifter::default();
    let mut outer = Vec::with_capacity(simulate.columns.len());
    for column in &simulate.columns {
        if let SelectColumn::Exp { expr, name } = column {
            let name = name.clone().or_else(|| match expr {
                Expr::Col { column, .. } => Some(column.clone()),
                _ => None,
            });
            outer.push(SelectColumn::Exp {
                expr: lifter.lift(expr)?,
                name,
            });
        }
    }
    let inner = Query::SimulateModels(SimulateModels {
        columns: lifter.primitives,
        population: simulate.population.clone(),
        generator: simulate.generator.clone(),
    });
    Ok(Query::Select(Select {
        distinct: false,
        columns: outer,
        from: Some(vec![FromItem::Subquery {
            query: Box::new(inner),
            alias: None,
        }]),
        condition: None,
        group_by: None,
        having: None,
        order_by: None,
        limit: None,
    }))
}

/// `PROBABILITY OF (e)` as `(SELECT AVG(x) FROM (SIMULATE e AS x FROM MODELS OF p))`.
pub fn expand_probability_estimate(
    expr: &Expr,
    population: &str,
    generator: Option<&str>,
) -> Query {
    let simulate = Query::SimulateModelsExp(SimulateModels {
        columns: vec![SelectColumn::Exp {
            expr: expr.clone(),
            name: Some(ESTIMATE_COLUMN.to_string()),
        }],
        population: population.to_string(),
        generator: generator.map(str::to_string),
    });
    Query::Select(Select {
        distinct: false,
        columns: vec![SelectColumn::Exp {
            expr: Expr::App {
                name: "AVG".to_string(),
                distinct: false,
                args: vec![Expr::column(ESTIMATE_COLUMN)],
            },
            name: None,
        }],
        from: Some(vec![FromItem::Subquery {
            query: Box::new(simulate),
            alias: None,
        }]),
        condition: None,
        group_by: None,
        having: None,
        order_by: None,
        limit: None,
    })
}

/// Collects primitive sub-terms, replacing each with a synthetic column.
#[derive(Default)]
struct Lifter {
    primitives: Vec<SelectColumn>,
}

impl Lifter {
    fn synthesize(&mut self, expr: &Expr) -> Expr {
        let name = format!("{SIM_COLUMN_PREFIX}{}", self.primitives.len());
        self.primitives.push(SelectColumn::Exp {
            expr: expr.clone(),
            name: Some(name.clone()),
        });
        Expr::column(name)
    }

    fn lift_all(&mut self, exprs: &[Expr]) -> Result<Vec<Expr>> {
        exprs.iter().map(|e| self.lift(e)).collect()
    }

    fn lift(&mut self, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Lit(_) | Expr::NumPar(_) | Expr::NamPar(..) | Expr::AppStar(_) => expr.clone(),
            // Subqueries are opaque here.
            Expr::Sub(_) | Expr::Exists(_) => expr.clone(),
            Expr::Col { .. } => self.synthesize(expr),
            Expr::Collate(inner, collation) => {
                Expr::Collate(Box::new(self.lift(inner)?), collation.clone())
            }
            Expr::InList {
                expr: inner,
                negated,
                list,
            } => Expr::InList {
                expr: Box::new(self.lift(inner)?),
                negated: *negated,
                list: self.lift_all(list)?,
            },
            Expr::InQuery {
                expr: inner,
                negated,
                query,
            } => Expr::InQuery {
                expr: Box::new(self.lift(inner)?),
                negated: *negated,
                query: query.clone(),
            },
            Expr::Cast(inner, type_name) => Expr::Cast(Box::new(self.lift(inner)?), type_name.clone()),
            Expr::App {
                name,
                distinct,
                args,
            } => Expr::App {
                name: name.clone(),
                distinct: *distinct,
                args: self.lift_all(args)?,
            },
            Expr::Case { .. } => {
                return Err(BqlError::compile(
                    "CASE in SIMULATE ... FROM MODELS OF is not yet supported",
                ));
            }
            Expr::Op(op, operands) => Expr::Op(*op, self.lift_all(operands)?),
            Expr::Bql(f) => match **f {
                BqlFn::ProbEstimate(_) => {
                    return Err(BqlError::compile(
                        "PROBABILITY OF cannot be nested in SIMULATE ... FROM MODELS OF",
                    ));
                }
                _ => self.synthesize(expr),
            },
        })
    }
}
