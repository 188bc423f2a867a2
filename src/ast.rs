//! Abstract syntax of BQL phrases.
//!
//! Every node is immutable once built by the parser. Query nodes enumerate
//! exactly the clauses legal for their form, so the compiler can match on
//! them exhaustively.

use bimap::BiMap;

/// A parsed phrase. Phrases that mention parameters carry the largest
/// parameter number and the map from named-parameter spelling to number.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPhrase {
    Bare(Phrase),
    Parametrized {
        phrase: Phrase,
        n_numpar: usize,
        nampar_map: BiMap<String, usize>,
    },
}

impl ParsedPhrase {
    pub fn phrase(&self) -> &Phrase {
        match self {
            ParsedPhrase::Bare(phrase) => phrase,
            ParsedPhrase::Parametrized { phrase, .. } => phrase,
        }
    }

    pub fn n_numpar(&self) -> usize {
        match self {
            ParsedPhrase::Bare(_) => 0,
            ParsedPhrase::Parametrized { n_numpar, .. } => *n_numpar,
        }
    }

    pub fn nampar_map(&self) -> Option<&BiMap<String, usize>> {
        match self {
            ParsedPhrase::Bare(_) => None,
            ParsedPhrase::Parametrized { nampar_map, .. } => Some(nampar_map),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phrase {
    Command(Command),
    Query(Query),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Begin,
    Commit,
    Rollback,
    CreateTableAs {
        temp: bool,
        if_not_exists: bool,
        name: String,
        query: Box<Query>,
    },
    DropTable {
        if_exists: bool,
        name: String,
    },
    CreatePopulation {
        if_not_exists: bool,
        name: String,
        table: String,
        schema: Vec<PopulationClause>,
    },
    DropPopulation {
        if_exists: bool,
        name: String,
    },
    AlterPopulation {
        population: String,
        commands: Vec<AlterPopulation>,
    },
    CreateGenerator {
        if_not_exists: bool,
        name: String,
        population: String,
        backend: Option<String>,
        schema: Vec<SchemaToken>,
    },
    DropGenerator {
        if_exists: bool,
        name: String,
    },
    AlterGenerator {
        generator: String,
        commands: Vec<AlterGenerator>,
    },
    InitializeModels {
        count: u32,
        if_not_exists: bool,
        generator: String,
    },
    AnalyzeModels(AnalyzeModels),
    DropModels {
        modelnos: Option<Vec<u32>>,
        generator: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeModels {
    pub generator: String,
    pub modelnos: Option<Vec<u32>>,
    pub iterations: Option<u64>,
    pub seconds: Option<u64>,
    pub checkpoint_iterations: Option<u64>,
    pub checkpoint_seconds: Option<u64>,
    pub wait: bool,
    pub program: Option<Vec<SchemaToken>>,
}

/// One `;`-separated clause of a CREATE POPULATION schema.
#[derive(Debug, Clone, PartialEq)]
pub enum PopulationClause {
    Model { columns: Vec<String>, stattype: String },
    Ignore(Vec<String>),
    /// `GUESS STATTYPES OF (*)` is `Guess(None)`.
    Guess(Option<Vec<String>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterPopulation {
    AddVariable {
        name: String,
        stattype: Option<String>,
    },
    SetStattype {
        columns: Vec<String>,
        stattype: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterGenerator {
    RenameTo(String),
    /// Anything else is handed to the backend untouched.
    Backend(Vec<SchemaToken>),
}

/// Backend-specific schema text, kept as a token tree with parentheses
/// turned into groups.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaToken {
    Word(String),
    Str(String),
    Number(f64),
    Punct(String),
    Group(Vec<SchemaToken>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Select),
    Estimate(Estimate),
    EstimateBy(EstimateBy),
    EstimateColumns(EstimateColumns),
    EstimatePairwiseColumns(EstimatePairwiseColumns),
    EstimatePairwiseRows(EstimatePairwiseRows),
    InferAuto(InferAuto),
    InferExplicit(InferExplicit),
    Simulate(Simulate),
    SimulateModels(SimulateModels),
    SimulateModelsExp(SimulateModels),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    Star,
    QualifiedStar(String),
    Exp { expr: Expr, name: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table { name: String, alias: Option<String> },
    Subquery { query: Box<Query>, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    pub limit: Expr,
    pub offset: Option<Expr>,
}

/// `MODELED BY g` and `USING MODEL(S) ranges`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSelection {
    pub generator: Option<String>,
    pub modelnos: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<SelectColumn>,
    pub from: Option<Vec<FromItem>>,
    pub condition: Option<Expr>,
    pub group_by: Option<Vec<Expr>>,
    pub having: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

/// `ESTIMATE ... FROM p`: one row of the population table per result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub distinct: bool,
    pub columns: Vec<SelectColumn>,
    pub population: String,
    pub models: ModelSelection,
    pub condition: Option<Expr>,
    pub group_by: Option<Vec<Expr>>,
    pub having: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

/// `ESTIMATE ... BY p`: a single row with no implied rows or columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateBy {
    pub distinct: bool,
    pub columns: Vec<SelectColumn>,
    pub population: String,
    pub models: ModelSelection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSubset {
    Names(Vec<String>),
    Query(Box<Query>),
}

/// `ESTIMATE ... FROM VARIABLES OF p`: one result row per variable.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateColumns {
    pub columns: Vec<SelectColumn>,
    pub population: String,
    pub models: ModelSelection,
    pub subset: Option<ColumnSubset>,
    pub condition: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

/// `ESTIMATE ... FROM PAIRWISE VARIABLES OF p`.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatePairwiseColumns {
    pub columns: Vec<SelectColumn>,
    pub population: String,
    pub models: ModelSelection,
    pub subset: Option<ColumnSubset>,
    pub condition: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

/// `ESTIMATE ... FROM PAIRWISE p`: one result row per pair of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatePairwiseRows {
    pub columns: Vec<SelectColumn>,
    pub population: String,
    pub models: ModelSelection,
    pub condition: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferAuto {
    pub columns: Vec<SelectColumn>,
    pub confidence: Option<Expr>,
    pub nsamples: Option<Expr>,
    pub population: String,
    pub models: ModelSelection,
    pub condition: Option<Expr>,
    pub group_by: Option<Vec<Expr>>,
    pub having: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferColumn {
    Select(SelectColumn),
    /// `PREDICT x [AS name] CONFIDENCE c [USING n SAMPLES]`
    Predict {
        variable: String,
        name: Option<String>,
        confidence_name: String,
        nsamples: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferExplicit {
    pub columns: Vec<InferColumn>,
    pub population: String,
    pub models: ModelSelection,
    pub condition: Option<Expr>,
    pub group_by: Option<Vec<Expr>>,
    pub having: Option<Expr>,
    pub order_by: Option<Vec<OrderItem>>,
    pub limit: Option<Limit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Simulate {
    pub columns: Vec<String>,
    pub population: String,
    pub models: ModelSelection,
    pub constraints: Vec<(String, Expr)>,
    pub limit: Expr,
    pub accuracy: Option<u32>,
}

/// `SIMULATE ... FROM MODELS OF p`: one result row per model.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulateModels {
    pub columns: Vec<SelectColumn>,
    pub population: String,
    pub generator: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Or,
    And,
    Not,
    Eq,
    Ne,
    Is,
    IsNot,
    Like,
    NotLike,
    Glob,
    NotGlob,
    Regexp,
    NotRegexp,
    Match,
    NotMatch,
    Between,
    NotBetween,
    IsNull,
    NotNull,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Neg,
    Plus,
    BitNot,
}

impl Op {
    /// SQL template, `%s` marking operand positions.
    pub fn template(self) -> &'static str {
        match self {
            Op::Or => "(%s OR %s)",
            Op::And => "(%s AND %s)",
            Op::Not => "(NOT %s)",
            Op::Eq => "(%s = %s)",
            Op::Ne => "(%s != %s)",
            Op::Is => "(%s IS %s)",
            Op::IsNot => "(%s IS NOT %s)",
            Op::Like => "(%s LIKE %s)",
            Op::NotLike => "(%s NOT LIKE %s)",
            Op::Glob => "(%s GLOB %s)",
            Op::NotGlob => "(%s NOT GLOB %s)",
            Op::Regexp => "(%s REGEXP %s)",
            Op::NotRegexp => "(%s NOT REGEXP %s)",
            Op::Match => "(%s MATCH %s)",
            Op::NotMatch => "(%s NOT MATCH %s)",
            Op::Between => "(%s BETWEEN %s AND %s)",
            Op::NotBetween => "(%s NOT BETWEEN %s AND %s)",
            Op::IsNull => "(%s ISNULL)",
            Op::NotNull => "(%s NOTNULL)",
            Op::Lt => "(%s < %s)",
            Op::Le => "(%s <= %s)",
            Op::Gt => "(%s > %s)",
            Op::Ge => "(%s >= %s)",
            Op::BitAnd => "(%s & %s)",
            Op::BitOr => "(%s | %s)",
            Op::Shl => "(%s << %s)",
            Op::Shr => "(%s >> %s)",
            Op::Add => "(%s + %s)",
            Op::Sub => "(%s - %s)",
            Op::Mul => "(%s * %s)",
            Op::Div => "(%s / %s)",
            Op::Rem => "(%s % %s)",
            Op::Concat => "(%s || %s)",
            Op::Neg => "(- %s)",
            Op::Plus => "(+ %s)",
            Op::BitNot => "(~ %s)",
        }
    }

    pub fn arity(self) -> usize {
        self.template().matches("%s").count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal),
    /// Positional parameter, already numbered.
    NumPar(usize),
    /// Named parameter: its number and its spelling.
    NamPar(usize, String),
    Col {
        table: Option<String>,
        column: String,
    },
    Sub(Box<Query>),
    Collate(Box<Expr>, String),
    InList {
        expr: Box<Expr>,
        negated: bool,
        list: Vec<Expr>,
    },
    InQuery {
        expr: Box<Expr>,
        negated: bool,
        query: Box<Query>,
    },
    Cast(Box<Expr>, String),
    Exists(Box<Query>),
    App {
        name: String,
        distinct: bool,
        args: Vec<Expr>,
    },
    AppStar(String),
    Case {
        key: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    Op(Op, Vec<Expr>),
    Bql(Box<BqlFn>),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Col {
            table: None,
            column: name.into(),
        }
    }
}

/// A column operand that may be the wildcard `*`.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnList {
    All,
    Names(Vec<String>),
}

/// Probabilistic primitives.
#[derive(Debug, Clone, PartialEq)]
pub enum BqlFn {
    PredProb {
        targets: Vec<String>,
        constraints: Option<ColumnList>,
    },
    ProbDensity {
        targets: Vec<(String, Expr)>,
        constraints: Vec<(String, Expr)>,
    },
    ProbDensityValue {
        value: Expr,
        constraints: Vec<(String, Expr)>,
    },
    ProbEstimate(Expr),
    Similarity {
        of: Option<Expr>,
        to: Option<Expr>,
        context: Vec<String>,
    },
    PredRelevance {
        of: Option<Expr>,
        existing: Option<Expr>,
        hypotheticals: Vec<Vec<(String, Expr)>>,
        context: String,
    },
    DepProb {
        of: Option<String>,
        with: Option<String>,
    },
    MutInf {
        of: Option<ColumnList>,
        with: Option<ColumnList>,
        constraints: Vec<(String, Expr)>,
        nsamples: Option<Expr>,
    },
    Correlation {
        of: Option<String>,
        with: Option<String>,
    },
    Predict {
        column: String,
        confidence: Option<Expr>,
        nsamples: Option<Expr>,
    },
}

impl BqlFn {
    /// Human-readable name used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            BqlFn::PredProb { .. } => "predictive probability",
            BqlFn::ProbDensity { .. } => "probability density",
            BqlFn::ProbDensityValue { .. } => "probability density of value",
            BqlFn::ProbEstimate(_) => "probability of",
            BqlFn::Similarity { .. } => "similarity",
            BqlFn::PredRelevance { .. } => "predictive relevance",
            BqlFn::DepProb { .. } => "dependence probability",
            BqlFn::MutInf { .. } => "mutual information",
            BqlFn::Correlation { .. } => "correlation",
            BqlFn::Predict { .. } => "predict",
        }
    }
}
