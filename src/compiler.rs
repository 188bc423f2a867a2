//! BQL to SQL code generation.
//!
//! Each query shape gets a [`Context`] saying which population and models it
//! ranges over and which row or column positions it supplies implicitly.
//! Probabilistic primitives become calls to the `bql_*` SQL functions.
//! SIMULATE is run eagerly: its rows are materialized into a temporary table
//! by winders, the compiled text reads that table, and an unwinder drops it.

use std::cell::RefCell;
use std::collections::BTreeSet;

use regex::Regex;
use rusqlite::Connection;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use tracing::debug;

use crate::ast::{
    BqlFn, ColumnList, ColumnSubset, Estimate, EstimateBy, EstimateColumns,
    EstimatePairwiseColumns, EstimatePairwiseRows, Expr, FromItem, InferAuto, InferColumn,
    InferExplicit, Limit, ModelSelection, Op, OrderItem, ParsedPhrase, Phrase, Query, Select,
    SelectColumn, Simulate, SimulateModels,
};
use crate::catalog::{Catalog, Generator, Population, Variable};
use crate::context::{Arity, Context, Dimension};
use crate::engine::Shared;
use crate::error::{BqlError, Result};
use crate::functions::Ensemble;
use crate::macros::{expand_probability_estimate, expand_simulate_models};
use crate::output::{BoundStatement, Bindings, Compiled, Output, Params, quote_ident, quote_string};

/// Alias of the materialized inner query of INFER EXPLICIT.
const INFER_ALIAS: &str = "_bql_infer";
const INFER_ROWID: &str = "_bql_rowid";
const PREDICT_COLUMN_PREFIX: &str = "_bql_pc_";
const MODELS_ALIAS: &str = "_bql_models";

fn colnos_literal(colnos: &[i64]) -> Result<String> {
    Ok(quote_string(&serde_json::to_string(colnos)?))
}

fn write_function_name(out: &mut Output<'_>, name: &str) {
    let plain = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        out.write(name);
    } else {
        out.write_ident(name);
    }
}

/// One operand position of MUTUAL INFORMATION.
enum Operand {
    Implicit(String),
    Names(Vec<i64>),
    All,
}

pub struct Compiler<'c> {
    catalog: Catalog<'c>,
    shared: &'c Shared,
    /// Temporary table names handed out during this compile.
    reserved: RefCell<BTreeSet<String>>,
}

impl<'c> Compiler<'c> {
    pub fn new(connection: &'c Connection, shared: &'c Shared) -> Compiler<'c> {
        Compiler {
            catalog: Catalog::new(connection, &shared.cache),
            shared,
            reserved: RefCell::new(BTreeSet::new()),
        }
    }

    /// Compiles a query phrase.
    pub fn compile(&self, phrase: &ParsedPhrase, bindings: &Bindings) -> Result<Compiled> {
        let Phrase::Query(query) = phrase.phrase() else {
            return Err(BqlError::compile("only queries compile to SQL"));
        };
        self.compile_query(query, Params::for_phrase(phrase), bindings)
    }

    /// Compiles `query` against the parameters declared by its phrase.
    pub fn compile_query(&self, query: &Query, mut params: Params, bindings: &Bindings) -> Result<Compiled> {
        let mut out = Output::new(&mut params, bindings);
        self.query(query, &mut out)?;
        let compiled = out.finish()?;
        debug!(
            sql = %compiled.sql,
            bindings = compiled.bindings.len(),
            winders = compiled.winders.len(),
            "compiled query"
        );
        Ok(compiled)
    }

    fn query(&self, query: &Query, out: &mut Output<'_>) -> Result<()> {
        match query {
            Query::Select(select) => self.select(select, out),
            Query::Estimate(estimate) => self.estimate(estimate, out),
            Query::EstimateBy(estimate) => self.estimate_by(estimate, out),
            Query::EstimateColumns(estimate) => self.estimate_columns(estimate, out),
            Query::EstimatePairwiseColumns(estimate) => self.estimate_pairwise_columns(estimate, out),
            Query::EstimatePairwiseRows(estimate) => self.estimate_pairwise_rows(estimate, out),
            Query::InferAuto(infer) => self.infer_auto(infer, out),
            Query::InferExplicit(infer) => self.infer_explicit(infer, out),
            Query::Simulate(simulate) => self.simulate(simulate, out),
            Query::SimulateModels(simulate) => self.simulate_models(simulate, out),
            Query::SimulateModelsExp(simulate) => {
                let expanded = expand_simulate_models(simulate)?;
                self.query(&expanded, out)
            }
        }
    }

    // ------------------------------------------------------------ catalog

    fn model_generator(&self, population: &Population, name: &str) -> Result<Generator> {
        let generator = self.catalog.require_generator(name)?;
        if generator.population_id != population.id {
            return Err(BqlError::compile(format!(
                "generator {} does not model population {}",
                generator.name, population.name
            )));
        }
        Ok(generator)
    }

    fn context(&self, arity: Arity, population: &str, models: &ModelSelection) -> Result<Context> {
        let population = self.catalog.require_population(population)?;
        let mut ctx = Context::plain();
        ctx.arity = arity;
        ctx.population_id = population.id;
        ctx.table = population.table.clone();
        if let Some(name) = &models.generator {
            let generator = self.model_generator(&population, name)?;
            if let Some(modelnos) = &models.modelnos {
                let available = self.catalog.modelnos(generator.id)?;
                if let Some(missing) = modelnos.iter().find(|m| !available.contains(m)) {
                    return Err(BqlError::compile(format!(
                        "generator {} has no model {missing}",
                        generator.name
                    )));
                }
            }
            ctx.generator_sql = generator.id.to_string();
            ctx.generator_id = Some(generator.id);
            ctx.generator_name = Some(generator.name);
        }
        if let Some(modelnos) = &models.modelnos {
            ctx.models_sql = quote_string(&serde_json::to_string(modelnos)?);
        }
        ctx.population = population.name;
        Ok(ctx)
    }

    /// Finds a variable of the context's population. Latent variables are
    /// only visible once MODELED BY names their generator.
    fn variable(&self, ctx: &Context, name: &str) -> Result<Variable> {
        if let Some(variable) = self
            .catalog
            .variable_by_name(ctx.population_id, ctx.generator_id, name)?
        {
            return Ok(variable);
        }
        if ctx.generator_id.is_none() && self.catalog.latent_variable_exists(ctx.population_id, name)? {
            return Err(BqlError::compile(format!(
                "variable {name} is latent; name its generator with MODELED BY"
            )));
        }
        Err(BqlError::compile(format!(
            "no such variable {name} in population {}",
            ctx.population
        )))
    }

    fn colno(&self, ctx: &Context, name: &str) -> Result<i64> {
        Ok(self.variable(ctx, name)?.colno)
    }

    fn manifest_variable(&self, ctx: &Context, name: &str, what: &str) -> Result<Variable> {
        let variable = self.variable(ctx, name)?;
        if variable.is_latent() {
            return Err(BqlError::compile(format!(
                "{what} needs manifest variables, but {name} is latent"
            )));
        }
        Ok(variable)
    }

    fn all_colnos(&self, ctx: &Context) -> Result<Vec<i64>> {
        Ok(self
            .catalog
            .variables(ctx.population_id, ctx.generator_id)?
            .iter()
            .map(|v| v.colno)
            .collect())
    }

    /// Resolves `(name, expr)` constraints, refusing repeats and names in
    /// `taken`.
    fn constraint_colnos(
        &self,
        ctx: &Context,
        constraints: &[(String, Expr)],
        taken: &[i64],
        what: &str,
    ) -> Result<Vec<i64>> {
        let mut colnos: Vec<i64> = Vec::with_capacity(constraints.len());
        for (name, _) in constraints {
            let colno = self.colno(ctx, name)?;
            if taken.contains(&colno) {
                return Err(BqlError::compile(format!(
                    "{what}: variable {name} is both a target and a constraint"
                )));
            }
            if colnos.contains(&colno) {
                return Err(BqlError::compile(format!(
                    "{what}: variable {name} is constrained twice"
                )));
            }
            colnos.push(colno);
        }
        Ok(colnos)
    }

    fn temp_name(&self) -> Result<String> {
        let prefix = &self.shared.settings.temp_prefix;
        let pattern = Regex::new(&format!("(?i)^{}_([0-9]+)$", regex::escape(prefix)))
            .map_err(|e| BqlError::Invariant(e.to_string()))?;
        let mut taken: BTreeSet<u64> = BTreeSet::new();
        {
            let reserved = self.reserved.borrow();
            for name in self.catalog.temp_table_names()?.iter().chain(reserved.iter()) {
                if let Some(k) = pattern.captures(name).and_then(|c| c[1].parse().ok()) {
                    taken.insert(k);
                }
            }
        }
        let mut k = 0;
        while taken.contains(&k) {
            k += 1;
        }
        let name = format!("{prefix}_{k}");
        self.reserved.borrow_mut().insert(name.clone());
        Ok(name)
    }

    // -------------------------------------------------------- expressions

    fn expr(&self, ctx: &Context, expr: &Expr, out: &mut Output<'_>) -> Result<()> {
        match expr {
            Expr::Lit(literal) => out.write_literal(literal),
            Expr::NumPar(n) | Expr::NamPar(n, _) => out.write_param(*n)?,
            Expr::Col { table, column } => {
                if let Some(table) = table {
                    out.write_ident(table);
                    out.write(".");
                }
                out.write_ident(column);
            }
            Expr::Sub(query) => {
                out.write("(");
                out.write_nested(|o| self.query(query, o))?;
                out.write(")");
            }
            Expr::Collate(inner, collation) => {
                out.write("(");
                self.expr(ctx, inner, out)?;
                out.write(" COLLATE ");
                out.write_ident(collation);
                out.write(")");
            }
            Expr::InList { expr, negated, list } => {
                out.write("(");
                self.expr(ctx, expr, out)?;
                out.write(if *negated { " NOT IN (" } else { " IN (" });
                self.expr_list(ctx, list, out)?;
                out.write("))");
            }
            Expr::InQuery {
                expr,
                negated,
                query,
            } => {
                out.write("(");
                self.expr(ctx, expr, out)?;
                out.write(if *negated { " NOT IN (" } else { " IN (" });
                out.write_nested(|o| self.query(query, o))?;
                out.write("))");
            }
            Expr::Cast(inner, type_name) => {
                out.write("CAST(");
                self.expr(ctx, inner, out)?;
                out.write(&format!(" AS {type_name})"));
            }
            Expr::Exists(query) => {
                out.write("EXISTS (");
                out.write_nested(|o| self.query(query, o))?;
                out.write(")");
            }
            Expr::App {
                name,
                distinct,
                args,
            } => {
                write_function_name(out, name);
                out.write(if *distinct { "(DISTINCT " } else { "(" });
                self.expr_list(ctx, args, out)?;
                out.write(")");
            }
            Expr::AppStar(name) => {
                write_function_name(out, name);
                out.write("(*)");
            }
            Expr::Case {
                key,
                whens,
                otherwise,
            } => {
                out.write("CASE");
                if let Some(key) = key {
                    out.write(" ");
                    self.expr(ctx, key, out)?;
                }
                for (when, then) in whens {
                    out.write(" WHEN ");
                    self.expr(ctx, when, out)?;
                    out.write(" THEN ");
                    self.expr(ctx, then, out)?;
                }
                if let Some(otherwise) = otherwise {
                    out.write(" ELSE ");
                    self.expr(ctx, otherwise, out)?;
                }
                out.write(" END");
            }
            Expr::Op(op, operands) => self.op(ctx, *op, operands, out)?,
            Expr::Bql(f) => self.bql(ctx, f, out)?,
        }
        Ok(())
    }

    fn op(&self, ctx: &Context, op: Op, operands: &[Expr], out: &mut Output<'_>) -> Result<()> {
        if operands.len() != op.arity() {
            return Err(BqlError::Invariant(format!(
                "{op:?} takes {} operands, got {}",
                op.arity(),
                operands.len()
            )));
        }
        let mut pieces = op.template().split("%s");
        out.write(pieces.next().unwrap_or_default());
        for (operand, piece) in operands.iter().zip(pieces) {
            self.expr(ctx, operand, out)?;
            out.write(piece);
        }
        Ok(())
    }

    fn expr_list(&self, ctx: &Context, exprs: &[Expr], out: &mut Output<'_>) -> Result<()> {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                out.write(", ");
            }
            self.expr(ctx, expr, out)?;
        }
        Ok(())
    }

    fn optional_expr(&self, ctx: &Context, expr: Option<&Expr>, default: &str, out: &mut Output<'_>) -> Result<()> {
        match expr {
            Some(expr) => self.expr(ctx, expr, out),
            None => {
                out.write(default);
                Ok(())
            }
        }
    }

    /// `(column number, value)` argument pairs.
    fn write_pairs(
        &self,
        ctx: &Context,
        colnos: &[i64],
        values: &[(String, Expr)],
        out: &mut Output<'_>,
    ) -> Result<()> {
        for (colno, (_, value)) in colnos.iter().zip(values) {
            out.write(&format!(", {colno}, "));
            self.expr(ctx, value, out)?;
        }
        Ok(())
    }

    /// Common leading arguments of the ensemble functions.
    fn call(&self, ctx: &Context, function: &str, out: &mut Output<'_>) {
        out.write(&format!(
            "{function}({}, {}, {}",
            ctx.population_id, ctx.generator_sql, ctx.models_sql
        ));
    }

    /// SQL for the first row of the population table matching `condition`.
    fn row_selector(&self, ctx: &Context, condition: &Expr, out: &mut Output<'_>) -> Result<String> {
        let table = quote_ident(&ctx.table);
        let (text, ()) = out.nested(|o| {
            o.write(&format!("(SELECT _rowid_ FROM {table} WHERE "));
            self.expr(&Context::plain(), condition, o)?;
            o.write(" LIMIT 1)");
            Ok(())
        })?;
        Ok(text)
    }

    fn bql(&self, ctx: &Context, f: &BqlFn, out: &mut Output<'_>) -> Result<()> {
        let what = f.describe();
        ctx.arity.check_bql(what)?;
        match f {
            BqlFn::PredProb {
                targets,
                constraints,
            } => {
                let rows = ctx.fill(what, Dimension::Rows, 1, Vec::new())?;
                let mut target_vars: Vec<Variable> = Vec::with_capacity(targets.len());
                for name in targets {
                    let variable = self.manifest_variable(ctx, name, what)?;
                    if target_vars.iter().any(|v| v.colno == variable.colno) {
                        return Err(BqlError::compile(format!(
                            "{what}: variable {name} is a target twice"
                        )));
                    }
                    target_vars.push(variable);
                }
                let target_colnos: Vec<i64> = target_vars.iter().map(|v| v.colno).collect();
                let constraint_vars: Vec<Variable> = match constraints {
                    None => Vec::new(),
                    Some(ColumnList::All) => self
                        .catalog
                        .manifest_variables(ctx.population_id)?
                        .into_iter()
                        .filter(|v| !target_colnos.contains(&v.colno))
                        .collect(),
                    Some(ColumnList::Names(names)) => {
                        let mut vars: Vec<Variable> = Vec::with_capacity(names.len());
                        for name in names {
                            let variable = self.manifest_variable(ctx, name, what)?;
                            if target_colnos.contains(&variable.colno) {
                                return Err(BqlError::compile(format!(
                                    "{what}: variable {name} is both a target and a constraint"
                                )));
                            }
                            if vars.iter().any(|v| v.colno == variable.colno) {
                                return Err(BqlError::compile(format!(
                                    "{what}: variable {name} is constrained twice"
                                )));
                            }
                            vars.push(variable);
                        }
                        vars
                    }
                };
                self.call(ctx, "bql_pdf_joint", out);
                out.write(&format!(", {}, {}", rows[0], target_vars.len()));
                for variable in target_vars.iter().chain(&constraint_vars) {
                    out.write(&format!(
                        ", {}, {}.{}",
                        variable.colno,
                        ctx.row_qualifier,
                        quote_ident(&variable.name)
                    ));
                }
                out.write(")");
            }
            BqlFn::ProbDensity {
                targets,
                constraints,
            } => {
                let target_colnos = self.constraint_colnos(ctx, targets, &[], what)?;
                let constraint_colnos = self.constraint_colnos(ctx, constraints, &target_colnos, what)?;
                self.call(ctx, "bql_pdf_joint", out);
                out.write(&format!(", NULL, {}", targets.len()));
                self.write_pairs(ctx, &target_colnos, targets, out)?;
                self.write_pairs(ctx, &constraint_colnos, constraints, out)?;
                out.write(")");
            }
            BqlFn::ProbDensityValue { value, constraints } => {
                let columns = ctx.fill(what, Dimension::Columns, 1, Vec::new())?;
                let constraint_colnos = self.constraint_colnos(ctx, constraints, &[], what)?;
                self.call(ctx, "bql_pdf_joint", out);
                out.write(&format!(", NULL, 1, {}, ", columns[0]));
                self.expr(ctx, value, out)?;
                self.write_pairs(ctx, &constraint_colnos, constraints, out)?;
                out.write(")");
            }
            BqlFn::ProbEstimate(expr) => {
                let query = expand_probability_estimate(expr, &ctx.population, ctx.generator_name.as_deref());
                out.write("(");
                out.write_nested(|o| self.query(&query, o))?;
                out.write(")");
            }
            BqlFn::Similarity { of, to, context } => {
                let mut explicit = Vec::with_capacity(2);
                for condition in [of, to].into_iter().flatten() {
                    explicit.push(self.row_selector(ctx, condition, out)?);
                }
                let rows = ctx.fill(what, Dimension::Rows, 2, explicit)?;
                let colnos = if context.is_empty() {
                    self.all_colnos(ctx)?
                } else {
                    context
                        .iter()
                        .map(|name| self.colno(ctx, name))
                        .collect::<Result<Vec<i64>>>()?
                };
                self.call(ctx, "bql_row_similarity", out);
                out.write(&format!(", {}, {}, {})", rows[0], rows[1], colnos_literal(&colnos)?));
            }
            BqlFn::PredRelevance {
                of,
                existing,
                hypotheticals,
                context,
            } => {
                let explicit = match of {
                    Some(condition) => vec![self.row_selector(ctx, condition, out)?],
                    None => Vec::new(),
                };
                let rows = ctx.fill(what, Dimension::Rows, 1, explicit)?;
                let query = match existing {
                    Some(condition) => {
                        let table = quote_ident(&ctx.table);
                        let (text, ()) = out.nested(|o| {
                            o.write(&format!(
                                "(SELECT json_group_array(_rowid_) FROM {table} WHERE "
                            ));
                            self.expr(&Context::plain(), condition, o)?;
                            o.write(")");
                            Ok(())
                        })?;
                        text
                    }
                    None => quote_string("[]"),
                };
                let colno = self.colno(ctx, context)?;
                self.call(ctx, "bql_row_predictive_relevance", out);
                out.write(&format!(
                    ", {}, {query}, {colno}, {}",
                    rows[0],
                    hypotheticals.len()
                ));
                for row in hypotheticals {
                    let colnos = self.constraint_colnos(ctx, row, &[], what)?;
                    out.write(&format!(", {}", row.len()));
                    self.write_pairs(ctx, &colnos, row, out)?;
                }
                out.write(")");
            }
            BqlFn::DepProb { of, with } | BqlFn::Correlation { of, with } => {
                let explicit = [of, with]
                    .into_iter()
                    .flatten()
                    .map(|name| Ok(self.colno(ctx, name)?.to_string()))
                    .collect::<Result<Vec<String>>>()?;
                let columns = ctx.fill(what, Dimension::Columns, 2, explicit)?;
                if matches!(f, BqlFn::Correlation { .. }) {
                    out.write(&format!(
                        "bql_column_correlation({}, {}, {})",
                        ctx.population_id, columns[0], columns[1]
                    ));
                } else {
                    self.call(ctx, "bql_column_dependence_probability", out);
                    out.write(&format!(", {}, {})", columns[0], columns[1]));
                }
            }
            BqlFn::MutInf {
                of,
                with,
                constraints,
                nsamples,
            } => self.mutual_information(ctx, of, with, constraints, nsamples.as_ref(), out)?,
            BqlFn::Predict {
                column,
                confidence,
                nsamples,
            } => {
                let rows = ctx.fill(what, Dimension::Rows, 1, Vec::new())?;
                let colno = self.colno(ctx, column)?;
                self.call(ctx, "bql_predict", out);
                out.write(&format!(", {colno}, {}, ", rows[0]));
                self.optional_expr(ctx, confidence.as_ref(), "0", out)?;
                out.write(", ");
                self.optional_expr(ctx, nsamples.as_ref(), "NULL", out)?;
                out.write(")");
            }
        }
        Ok(())
    }

    fn mutual_information(
        &self,
        ctx: &Context,
        of: &Option<ColumnList>,
        with: &Option<ColumnList>,
        constraints: &[(String, Expr)],
        nsamples: Option<&Expr>,
        out: &mut Output<'_>,
    ) -> Result<()> {
        let what = "mutual information";
        let explicit: Vec<&ColumnList> = [of, with].into_iter().flatten().collect();
        let implicit = ctx.arity.check(what, Dimension::Columns, 2, explicit.len())?;
        if ctx.columns.len() < implicit {
            return Err(BqlError::Invariant(format!(
                "{} lacks implicit columns",
                ctx.arity.describe()
            )));
        }
        let mut operands: Vec<Operand> = ctx.columns[..implicit]
            .iter()
            .map(|sql| Operand::Implicit(sql.clone()))
            .collect();
        for list in explicit {
            operands.push(match list {
                ColumnList::All => Operand::All,
                ColumnList::Names(names) => Operand::Names(
                    names
                        .iter()
                        .map(|name| self.colno(ctx, name))
                        .collect::<Result<Vec<i64>>>()?,
                ),
            });
        }
        if matches!(operands.as_slice(), [Operand::All, Operand::All]) {
            return Err(BqlError::compile(format!(
                "{what} takes * in at most one position"
            )));
        }
        let mentioned: Vec<i64> = operands
            .iter()
            .flat_map(|o| match o {
                Operand::Names(colnos) => colnos.clone(),
                _ => Vec::new(),
            })
            .collect();
        let constraint_colnos = self.constraint_colnos(ctx, constraints, &mentioned, what)?;
        let mut rendered = Vec::with_capacity(2);
        for (i, operand) in operands.iter().enumerate() {
            rendered.push(match operand {
                Operand::Implicit(sql) => format!("json_array({sql})"),
                Operand::Names(colnos) => colnos_literal(colnos)?,
                Operand::All => match &operands[1 - i] {
                    Operand::Implicit(sql) => {
                        let generator_filter = match ctx.generator_id {
                            Some(id) => format!("(generator_id IS NULL OR generator_id = {id})"),
                            None => "generator_id IS NULL".to_string(),
                        };
                        let excluded: Vec<String> = constraint_colnos
                            .iter()
                            .map(|c| c.to_string())
                            .chain([sql.clone()])
                            .collect();
                        format!(
                            "(SELECT json_group_array(colno) FROM (SELECT colno FROM bql_variable \
                             WHERE population_id = {} AND {generator_filter} AND colno NOT IN ({}) \
                             ORDER BY colno))",
                            ctx.population_id,
                            excluded.join(", ")
                        )
                    }
                    _ => {
                        let rest: Vec<i64> = self
                            .all_colnos(ctx)?
                            .into_iter()
                            .filter(|c| !mentioned.contains(c) && !constraint_colnos.contains(c))
                            .collect();
                        colnos_literal(&rest)?
                    }
                },
            });
        }
        self.call(ctx, "bql_column_mutual_information", out);
        out.write(&format!(", {}, {}, ", rendered[0], rendered[1]));
        self.optional_expr(ctx, nsamples, "NULL", out)?;
        self.write_pairs(ctx, &constraint_colnos, constraints, out)?;
        out.write(")");
        Ok(())
    }

    // ------------------------------------------------------------ clauses

    fn select_column(&self, ctx: &Context, column: &SelectColumn, out: &mut Output<'_>) -> Result<()> {
        match column {
            SelectColumn::Star => out.write("*"),
            SelectColumn::QualifiedStar(table) => {
                out.write_ident(table);
                out.write(".*");
            }
            SelectColumn::Exp { expr, name } => {
                self.expr(ctx, expr, out)?;
                if let Some(name) = name {
                    out.write(" AS ");
                    out.write_ident(name);
                }
            }
        }
        Ok(())
    }

    fn select_columns(&self, ctx: &Context, columns: &[SelectColumn], out: &mut Output<'_>) -> Result<()> {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                out.write(", ");
            }
            self.select_column(ctx, column, out)?;
        }
        Ok(())
    }

    fn where_clause(&self, ctx: &Context, condition: Option<&Expr>, out: &mut Output<'_>) -> Result<()> {
        if let Some(condition) = condition {
            out.write(" WHERE ");
            self.expr(ctx, condition, out)?;
        }
        Ok(())
    }

    fn tail(
        &self,
        ctx: &Context,
        group_by: Option<&[Expr]>,
        having: Option<&Expr>,
        order_by: Option<&[OrderItem]>,
        limit: Option<&Limit>,
        out: &mut Output<'_>,
    ) -> Result<()> {
        if let Some(group_by) = group_by {
            out.write(" GROUP BY ");
            self.expr_list(ctx, group_by, out)?;
        }
        if let Some(having) = having {
            out.write(" HAVING ");
            self.expr(ctx, having, out)?;
        }
        if let Some(order_by) = order_by {
            out.write(" ORDER BY ");
            for (i, item) in order_by.iter().enumerate() {
                if i > 0 {
                    out.write(", ");
                }
                self.expr(ctx, &item.expr, out)?;
                if item.descending {
                    out.write(" DESC");
                }
            }
        }
        if let Some(limit) = limit {
            let plain = Context::plain();
            out.write(" LIMIT ");
            self.expr(&plain, &limit.limit, out)?;
            if let Some(offset) = &limit.offset {
                out.write(" OFFSET ");
                self.expr(&plain, offset, out)?;
            }
        }
        Ok(())
    }

    fn from_item(&self, item: &FromItem, out: &mut Output<'_>) -> Result<()> {
        let alias = match item {
            FromItem::Table { name, alias } => {
                out.write_ident(name);
                alias
            }
            FromItem::Subquery { query, alias } => {
                out.write("(");
                out.write_nested(|o| self.query(query, o))?;
                out.write(")");
                alias
            }
        };
        if let Some(alias) = alias {
            out.write(" AS ");
            out.write_ident(alias);
        }
        Ok(())
    }

    fn one_row_context(&self, population: &str, models: &ModelSelection) -> Result<Context> {
        let mut ctx = self.context(Arity::OneRow, population, models)?;
        ctx.row_qualifier = quote_ident(&ctx.table);
        ctx.rows = vec![format!("{}._rowid_", ctx.row_qualifier)];
        Ok(ctx)
    }

    // ------------------------------------------------------------ queries

    fn select(&self, select: &Select, out: &mut Output<'_>) -> Result<()> {
        let ctx = Context::plain();
        out.write(if select.distinct { "SELECT DISTINCT " } else { "SELECT " });
        self.select_columns(&ctx, &select.columns, out)?;
        if let Some(from) = &select.from {
            out.write(" FROM ");
            for (i, item) in from.iter().enumerate() {
                if i > 0 {
                    out.write(", ");
                }
                self.from_item(item, out)?;
            }
        }
        self.where_clause(&ctx, select.condition.as_ref(), out)?;
        self.tail(
            &ctx,
            select.group_by.as_deref(),
            select.having.as_ref(),
            select.order_by.as_deref(),
            select.limit.as_ref(),
            out,
        )
    }

    fn estimate(&self, estimate: &Estimate, out: &mut Output<'_>) -> Result<()> {
        let ctx = self.one_row_context(&estimate.population, &estimate.models)?;
        out.write(if estimate.distinct { "SELECT DISTINCT " } else { "SELECT " });
        self.select_columns(&ctx, &estimate.columns, out)?;
        out.write(" FROM ");
        out.write(&ctx.row_qualifier);
        self.where_clause(&ctx, estimate.condition.as_ref(), out)?;
        self.tail(
            &ctx,
            estimate.group_by.as_deref(),
            estimate.having.as_ref(),
            estimate.order_by.as_deref(),
            estimate.limit.as_ref(),
            out,
        )
    }

    fn estimate_by(&self, estimate: &EstimateBy, out: &mut Output<'_>) -> Result<()> {
        let ctx = self.context(Arity::Constant, &estimate.population, &estimate.models)?;
        out.write(if estimate.distinct { "SELECT DISTINCT " } else { "SELECT " });
        self.select_columns(&ctx, &estimate.columns, out)
    }

    /// Restricts a `bql_variable` alias to the context's variables.
    fn variable_filter(&self, ctx: &Context, alias: &str, subset: Option<&ColumnSubset>, out: &mut Output<'_>) -> Result<()> {
        let v = quote_ident(alias);
        out.write(&format!("{v}.population_id = {}", ctx.population_id));
        match ctx.generator_id {
            Some(id) => out.write(&format!(
                " AND ({v}.generator_id IS NULL OR {v}.generator_id = {id})"
            )),
            None => out.write(&format!(" AND {v}.generator_id IS NULL")),
        }
        match subset {
            None => {}
            Some(ColumnSubset::Names(names)) => {
                let colnos = names
                    .iter()
                    .map(|name| Ok(self.colno(ctx, name)?.to_string()))
                    .collect::<Result<Vec<String>>>()?;
                out.write(&format!(" AND {v}.colno IN ({})", colnos.join(", ")));
            }
            Some(ColumnSubset::Query(query)) => {
                out.write(&format!(" AND {v}.name IN ("));
                out.write_nested(|o| self.query(query, o))?;
                out.write(")");
            }
        }
        Ok(())
    }

    fn estimate_columns(&self, estimate: &EstimateColumns, out: &mut Output<'_>) -> Result<()> {
        let mut ctx = self.context(Arity::OneColumn, &estimate.population, &estimate.models)?;
        ctx.columns = vec!["\"v\".colno".to_string()];
        out.write("SELECT ");
        self.select_columns(&ctx, &estimate.columns, out)?;
        out.write(" FROM bql_variable AS \"v\" WHERE ");
        self.variable_filter(&ctx, "v", estimate.subset.as_ref(), out)?;
        if let Some(condition) = &estimate.condition {
            out.write(" AND (");
            self.expr(&ctx, condition, out)?;
            out.write(")");
        }
        self.tail(
            &ctx,
            None,
            None,
            estimate.order_by.as_deref(),
            estimate.limit.as_ref(),
            out,
        )
    }

    fn estimate_pairwise_columns(&self, estimate: &EstimatePairwiseColumns, out: &mut Output<'_>) -> Result<()> {
        let mut ctx = self.context(Arity::TwoColumn, &estimate.population, &estimate.models)?;
        ctx.columns = vec!["\"v0\".colno".to_string(), "\"v1\".colno".to_string()];
        out.write("SELECT \"v0\".name AS \"name0\", \"v1\".name AS \"name1\", ");
        self.select_columns(&ctx, &estimate.columns, out)?;
        out.write(" FROM bql_variable AS \"v0\", bql_variable AS \"v1\" WHERE ");
        self.variable_filter(&ctx, "v0", estimate.subset.as_ref(), out)?;
        out.write(" AND ");
        self.variable_filter(&ctx, "v1", estimate.subset.as_ref(), out)?;
        if let Some(condition) = &estimate.condition {
            out.write(" AND (");
            self.expr(&ctx, condition, out)?;
            out.write(")");
        }
        self.tail(
            &ctx,
            None,
            None,
            estimate.order_by.as_deref(),
            estimate.limit.as_ref(),
            out,
        )
    }

    fn estimate_pairwise_rows(&self, estimate: &EstimatePairwiseRows, out: &mut Output<'_>) -> Result<()> {
        let mut ctx = self.context(Arity::TwoRow, &estimate.population, &estimate.models)?;
        ctx.rows = vec!["\"r0\"._rowid_".to_string(), "\"r1\"._rowid_".to_string()];
        let table = quote_ident(&ctx.table);
        out.write("SELECT \"r0\"._rowid_ AS \"rowid0\", \"r1\"._rowid_ AS \"rowid1\", ");
        self.select_columns(&ctx, &estimate.columns, out)?;
        out.write(&format!(" FROM {table} AS \"r0\", {table} AS \"r1\""));
        self.where_clause(&ctx, estimate.condition.as_ref(), out)?;
        self.tail(
            &ctx,
            None,
            None,
            estimate.order_by.as_deref(),
            estimate.limit.as_ref(),
            out,
        )
    }

    /// `IFNULL(x, prediction) AS x` for one variable of INFER.
    fn infer_variable(&self, ctx: &Context, infer: &InferAuto, variable: &Variable, alias: &str, out: &mut Output<'_>) -> Result<()> {
        if !variable.is_latent() {
            out.write(&format!("IFNULL({}.{}, ", ctx.row_qualifier, quote_ident(&variable.name)));
        }
        self.call(ctx, "bql_predict", out);
        out.write(&format!(", {}, {}, ", variable.colno, ctx.rows[0]));
        self.optional_expr(ctx, infer.confidence.as_ref(), "0", out)?;
        out.write(", ");
        self.optional_expr(ctx, infer.nsamples.as_ref(), "NULL", out)?;
        out.write(")");
        if !variable.is_latent() {
            out.write(")");
        }
        out.write(" AS ");
        out.write_ident(alias);
        Ok(())
    }

    fn infer_auto(&self, infer: &InferAuto, out: &mut Output<'_>) -> Result<()> {
        let ctx = self.one_row_context(&infer.population, &infer.models)?;
        out.write("SELECT ");
        let mut first = true;
        for column in &infer.columns {
            let variables: Vec<(Variable, String)> = match column {
                SelectColumn::Star => self
                    .catalog
                    .manifest_variables(ctx.population_id)?
                    .into_iter()
                    .map(|v| {
                        let name = v.name.clone();
                        (v, name)
                    })
                    .collect(),
                SelectColumn::Exp {
                    expr: Expr::Col { table: None, column },
                    name,
                } => match self
                    .catalog
                    .variable_by_name(ctx.population_id, ctx.generator_id, column)?
                {
                    Some(v) => {
                        let alias = name.clone().unwrap_or_else(|| column.clone());
                        vec![(v, alias)]
                    }
                    None => Vec::new(),
                },
                _ => Vec::new(),
            };
            if variables.is_empty() && matches!(column, SelectColumn::Star) {
                continue;
            }
            if variables.is_empty() {
                if !first {
                    out.write(", ");
                }
                first = false;
                self.select_column(&ctx, column, out)?;
                continue;
            }
            for (variable, alias) in &variables {
                if !first {
                    out.write(", ");
                }
                first = false;
                self.infer_variable(&ctx, infer, variable, alias, out)?;
            }
        }
        if first {
            return Err(BqlError::compile(format!(
                "INFER from population {} has no columns to produce",
                ctx.population
            )));
        }
        out.write(" FROM ");
        out.write(&ctx.row_qualifier);
        self.where_clause(&ctx, infer.condition.as_ref(), out)?;
        self.tail(
            &ctx,
            infer.group_by.as_deref(),
            infer.having.as_ref(),
            infer.order_by.as_deref(),
            infer.limit.as_ref(),
            out,
        )
    }

    /// Predictions are made once per row in a materialized inner query and
    /// read back by the outer one.
    fn infer_explicit(&self, infer: &InferExplicit, out: &mut Output<'_>) -> Result<()> {
        let inner = self.one_row_context(&infer.population, &infer.models)?;
        let mut outer = inner.clone();
        outer.row_qualifier = quote_ident(INFER_ALIAS);
        outer.rows = vec![format!("{}.{}", outer.row_qualifier, quote_ident(INFER_ROWID))];

        out.write(&format!(
            "WITH {} AS MATERIALIZED (SELECT {}.*, {}._rowid_ AS {}",
            quote_ident(INFER_ALIAS),
            inner.row_qualifier,
            inner.row_qualifier,
            quote_ident(INFER_ROWID)
        ));
        let mut k = 0;
        for column in &infer.columns {
            if let InferColumn::Predict {
                variable, nsamples, ..
            } = column
            {
                let colno = self.colno(&inner, variable)?;
                out.write(", ");
                self.call(&inner, "bql_predict_confidence", out);
                out.write(&format!(", {colno}, {}, ", inner.rows[0]));
                self.optional_expr(&inner, nsamples.as_ref(), "NULL", out)?;
                out.write(&format!(") AS {}", quote_ident(&format!("{PREDICT_COLUMN_PREFIX}{k}"))));
                k += 1;
            }
        }
        out.write(&format!(" FROM {}", inner.row_qualifier));
        self.where_clause(&inner, infer.condition.as_ref(), out)?;
        out.write(") SELECT ");

        let mut k = 0;
        for (i, column) in infer.columns.iter().enumerate() {
            if i > 0 {
                out.write(", ");
            }
            match column {
                InferColumn::Select(SelectColumn::Star) => {
                    let names: Vec<String> = self
                        .catalog
                        .table_columns(&inner.table)?
                        .iter()
                        .map(|c| format!("{}.{}", outer.row_qualifier, quote_ident(c)))
                        .collect();
                    out.write(&names.join(", "));
                }
                InferColumn::Select(column) => self.select_column(&outer, column, out)?,
                InferColumn::Predict {
                    variable,
                    name,
                    confidence_name,
                    ..
                } => {
                    let source = quote_ident(&format!("{PREDICT_COLUMN_PREFIX}{k}"));
                    k += 1;
                    out.write(&format!(
                        "bql_json_get({source}, 'value') AS {}, bql_json_get({source}, 'confidence') AS {}",
                        quote_ident(name.as_deref().unwrap_or(variable)),
                        quote_ident(confidence_name)
                    ));
                }
            }
        }
        out.write(&format!(" FROM {}", outer.row_qualifier));
        self.tail(
            &outer,
            infer.group_by.as_deref(),
            infer.having.as_ref(),
            infer.order_by.as_deref(),
            infer.limit.as_ref(),
            out,
        )
    }

    /// Draws the rows now and leaves winders that materialize them.
    fn simulate(&self, simulate: &Simulate, out: &mut Output<'_>) -> Result<()> {
        let what = "SIMULATE";
        let ctx = self.context(Arity::Constant, &simulate.population, &simulate.models)?;
        let mut targets: Vec<i64> = Vec::with_capacity(simulate.columns.len());
        for name in &simulate.columns {
            let colno = self.colno(&ctx, name)?;
            if targets.contains(&colno) {
                return Err(BqlError::compile(format!("{what}: variable {name} is simulated twice")));
            }
            targets.push(colno);
        }
        let constraint_colnos = self.constraint_colnos(&ctx, &simulate.constraints, &targets, what)?;

        // LIMIT and the constraint values may be arbitrary expressions over
        // the bound parameters, so evaluate them first.
        let mut helper_params = out.params().sibling();
        let helper = {
            let mut helper = Output::new(&mut helper_params, out.input());
            let plain = Context::plain();
            helper.write("SELECT ");
            self.expr(&plain, &simulate.limit, &mut helper)?;
            for (_, value) in &simulate.constraints {
                helper.write(", ");
                self.expr(&plain, value, &mut helper)?;
            }
            helper.finish()?
        };
        if !helper.winders.is_empty() {
            return Err(BqlError::compile(
                "SIMULATE limits and constraints cannot themselves simulate",
            ));
        }
        let width = 1 + simulate.constraints.len();
        let values: Vec<Value> = self.catalog.db.query_row(
            &helper.sql,
            params_from_iter(helper.bindings.iter()),
            |r| (0..width).map(|i| r.get::<_, Value>(i)).collect(),
        )?;
        let limit = match values.first() {
            Some(Value::Integer(n)) if *n >= 0 => *n as usize,
            other => {
                return Err(BqlError::Bind(format!(
                    "SIMULATE needs a non-negative integer LIMIT, got {other:?}"
                )));
            }
        };
        let constraints: Vec<(i64, Value)> = constraint_colnos
            .iter()
            .copied()
            .zip(values.into_iter().skip(1))
            .filter(|(_, v)| *v != Value::Null)
            .collect();

        let ensemble = Ensemble::new(
            self.catalog.db,
            self.shared,
            ctx.population_id,
            ctx.generator_id,
            simulate.models.modelnos.clone(),
        )?;
        let accuracy = simulate.accuracy.or(self.shared.settings.simulate_accuracy);
        let rows = ensemble.simulate(None, &targets, &constraints, limit, accuracy)?;

        let table = quote_ident(&self.temp_name()?);
        let columns: Vec<String> = simulate.columns.iter().map(|c| quote_ident(c)).collect();
        out.push_winder(BoundStatement::new(
            format!("CREATE TEMP TABLE {table} ({})", columns.join(", ")),
            Vec::new(),
        ));
        let placeholders: Vec<String> = (1..=targets.len()).map(|i| format!("?{i}")).collect();
        let insert = format!("INSERT INTO temp.{table} VALUES ({})", placeholders.join(", "));
        for row in rows {
            out.push_winder(BoundStatement::new(insert.clone(), row));
        }
        out.push_unwinder(BoundStatement::new(
            format!("DROP TABLE IF EXISTS temp.{table}"),
            Vec::new(),
        ));
        out.write(&format!("SELECT * FROM temp.{table}"));
        Ok(())
    }

    /// One result row per model of the selected generators.
    fn simulate_models(&self, simulate: &SimulateModels, out: &mut Output<'_>) -> Result<()> {
        let models = ModelSelection {
            generator: simulate.generator.clone(),
            modelnos: None,
        };
        let mut ctx = self.context(Arity::Constant, &simulate.population, &models)?;
        let generator_filter = match ctx.generator_id {
            Some(id) => format!("= {id}"),
            None => format!(
                "IN (SELECT id FROM bql_generator WHERE population_id = {})",
                ctx.population_id
            ),
        };
        let models_alias = quote_ident(MODELS_ALIAS);
        ctx.generator_sql = format!("{models_alias}.generator_id");
        ctx.models_sql = format!("json_array({models_alias}.modelno)");

        out.write("SELECT ");
        for (i, column) in simulate.columns.iter().enumerate() {
            if i > 0 {
                out.write(", ");
            }
            let SelectColumn::Exp { expr, name } = column else {
                return Err(BqlError::compile(
                    "SIMULATE ... FROM MODELS OF needs explicit columns, not *",
                ));
            };
            let alias = match expr {
                Expr::Col { column, .. } => {
                    let colno = self.colno(&ctx, column)?;
                    self.call(&ctx, "bql_simulate_value", out);
                    out.write(&format!(", {colno})"));
                    Some(name.clone().unwrap_or_else(|| column.clone()))
                }
                Expr::Bql(_) => {
                    self.expr(&ctx, expr, out)?;
                    name.clone()
                }
                _ => {
                    return Err(BqlError::Invariant(
                        "compound column reached SIMULATE ... FROM MODELS OF".to_string(),
                    ));
                }
            };
            if let Some(alias) = alias {
                out.write(" AS ");
                out.write_ident(&alias);
            }
        }
        out.write(&format!(
            " FROM (SELECT generator_id, modelno FROM bql_model WHERE generator_id {generator_filter} \
             ORDER BY generator_id, modelno) AS {models_alias}"
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::install;
    use crate::parser::parse_bql_phrase;

    fn compile(connection: &Connection, text: &str) -> Result<Compiled> {
        let shared = Shared::default();
        let phrase = parse_bql_phrase(text)?;
        Compiler::new(connection, &shared).compile(&phrase, &Bindings::None)
    }

    fn setup() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        install(&connection).unwrap();
        connection
            .execute_batch("create table t (x real, y text)")
            .unwrap();
        let cache = crate::cache::CacheSlot::default();
        let catalog = Catalog::new(&connection, &cache);
        let id = catalog.create_population("p", "t").unwrap();
        catalog.add_variable(id, None, 0, "x", "numerical").unwrap();
        catalog.add_variable(id, None, 1, "y", "nominal").unwrap();
        connection
    }

    #[test]
    fn plain_select_keeps_its_shape() {
        let connection = setup();
        let compiled = compile(&connection, "SELECT x + 1 AS z FROM t WHERE y = 'a' ORDER BY x DESC LIMIT 2").unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT (\"x\" + 1) AS \"z\" FROM \"t\" WHERE (\"y\" = 'a') ORDER BY \"x\" DESC LIMIT 2"
        );
        assert!(compiled.winders.is_empty());
    }

    #[test]
    fn dependence_probability_by_population_is_one_call() {
        let connection = setup();
        let compiled = compile(&connection, "ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p").unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT bql_column_dependence_probability(1, NULL, NULL, 0, 1)"
        );
    }

    #[test]
    fn primitives_are_refused_in_plain_sql() {
        let connection = setup();
        let err = compile(&connection, "SELECT DEPENDENCE PROBABILITY OF x WITH y FROM t").unwrap_err();
        assert!(err.to_string().contains("not in plain SQL"));
    }

    #[test]
    fn unknown_variables_are_named() {
        let connection = setup();
        let err = compile(&connection, "ESTIMATE DEPENDENCE PROBABILITY OF x WITH w BY p").unwrap_err();
        assert!(err.to_string().contains("no such variable w"));
    }

    #[test]
    fn star_in_both_mutual_information_positions_is_refused() {
        let connection = setup();
        let err = compile(&connection, "ESTIMATE MUTUAL INFORMATION OF * WITH * BY p").unwrap_err();
        assert!(err.to_string().contains("at most one position"));
    }
}
