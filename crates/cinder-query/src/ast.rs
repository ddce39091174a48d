use bson::Bson;

/// A parsed query.
///
/// The clause order is fixed: an optional `FOR`, any number of `LET`s and
/// `FILTER`s, an optional `LIMIT`, an optional data-modification clause,
/// an optional `COLLECT WITH COUNT INTO` and an optional `RETURN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub for_clause: Option<ForClause>,
    /// `LET` and `FILTER` clauses in source order.
    pub clauses: Vec<Clause>,
    pub limit: Option<LimitClause>,
    pub modification: Option<Modification>,
    /// Variable bound by `COLLECT WITH COUNT INTO <var>`.
    pub count_into: Option<String>,
    pub ret: Option<Expr>,
}

impl Query {
    pub fn filters(&self) -> impl Iterator<Item = &Expr> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Filter(e) => Some(e),
            Clause::Let { .. } => None,
        })
    }

    /// Every expression of this query, not descending into subqueries.
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        if let Some(ForClause {
            source: ForSource::Expr(e),
            ..
        }) = &self.for_clause
        {
            out.push(e);
        }
        for clause in &self.clauses {
            match clause {
                Clause::Let { value, .. } => out.push(value),
                Clause::Filter(e) => out.push(e),
            }
        }
        if let Some(limit) = &self.limit {
            out.extend(limit.offset.iter());
            out.push(&limit.count);
        }
        if let Some(m) = &self.modification {
            out.extend(m.kind.expressions());
            out.extend(m.options.iter());
        }
        out.extend(self.ret.iter());
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForClause {
    pub variable: String,
    pub source: ForSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForSource {
    Collection(CollectionRef),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Let { variable: String, value: Expr },
    Filter(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionRef {
    Name(String),
    /// `@@name`, resolved against the bind variables.
    Bind(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitClause {
    pub offset: Option<Expr>,
    pub count: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Modification {
    pub kind: ModificationKind,
    pub collection: CollectionRef,
    pub options: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModificationKind {
    Insert { document: Expr },
    /// `UPDATE doc IN c` or `UPDATE key WITH doc IN c`.
    Update { key: Option<Expr>, document: Expr },
    Replace { key: Option<Expr>, document: Expr },
    Remove { key: Expr },
    /// `UPSERT search INSERT insert UPDATE|REPLACE update IN c`. `OLD` is
    /// visible in `update`.
    Upsert {
        search: Expr,
        insert: Expr,
        update: Expr,
        replace: bool,
    },
}

impl ModificationKind {
    /// The expression that identifies the target document.
    pub fn selector(&self) -> &Expr {
        match self {
            ModificationKind::Insert { document } => document,
            ModificationKind::Update { key, document }
            | ModificationKind::Replace { key, document } => key.as_ref().unwrap_or(document),
            ModificationKind::Remove { key } => key,
            ModificationKind::Upsert { search, .. } => search,
        }
    }

    /// The body written by INSERT, UPDATE and REPLACE.
    pub fn document(&self) -> Option<&Expr> {
        match self {
            ModificationKind::Insert { document }
            | ModificationKind::Update { document, .. }
            | ModificationKind::Replace { document, .. } => Some(document),
            ModificationKind::Remove { .. } | ModificationKind::Upsert { .. } => None,
        }
    }

    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            ModificationKind::Insert { document } => vec![document],
            ModificationKind::Update { key, document }
            | ModificationKind::Replace { key, document } => {
                key.iter().chain(std::iter::once(document)).collect()
            }
            ModificationKind::Remove { key } => vec![key],
            ModificationKind::Upsert {
                search,
                insert,
                update,
                ..
            } => vec![search, insert, update],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Bson),
    Bind(String),
    Variable(String),
    Attribute {
        base: Box<Expr>,
        name: String,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Range(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// A parenthesized query. `id` is unique within the statement.
    Subquery {
        id: usize,
        query: Box<Query>,
    },
}

impl Expr {
    /// True if the value is known without any row: literals, bind
    /// parameters and pure operations over them. `NOOPT(...)` is never
    /// constant.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Bind(_) => true,
            Expr::Variable(_) | Expr::Subquery { .. } => false,
            Expr::Attribute { base, .. } => base.is_constant(),
            Expr::Index { base, index } => base.is_constant() && index.is_constant(),
            Expr::Object(fields) => fields.iter().all(|(_, e)| e.is_constant()),
            Expr::Array(items) => items.iter().all(Expr::is_constant),
            Expr::Range(lo, hi) => lo.is_constant() && hi.is_constant(),
            Expr::Unary(_, e) => e.is_constant(),
            Expr::Binary(_, l, r) => l.is_constant() && r.is_constant(),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => condition.is_constant() && then.is_constant() && otherwise.is_constant(),
            Expr::Call { name, args } => {
                !name.eq_ignore_ascii_case("NOOPT") && args.iter().all(Expr::is_constant)
            }
        }
    }

    /// If this is a plain attribute path on `var` (`var.a.b`), returns the
    /// path segments.
    pub fn attribute_path_of(&self, var: &str) -> Option<Vec<&str>> {
        match self {
            Expr::Variable(v) if v == var => Some(Vec::new()),
            Expr::Attribute { base, name } => {
                let mut path = base.attribute_path_of(var)?;
                path.push(name.as_str());
                Some(path)
            }
            Expr::Index { base, index } => match index.as_ref() {
                Expr::Literal(Bson::String(name)) => {
                    let mut path = base.attribute_path_of(var)?;
                    path.push(name.as_str());
                    Some(path)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// True if the expression reads `var` anywhere.
    pub fn references(&self, var: &str) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Variable(v) if v == var) {
                found = true;
            }
        });
        found
    }

    pub fn contains_subquery(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Subquery { .. }) {
                found = true;
            }
        });
        found
    }

    /// Visits this expression and every nested one, parents first.
    /// Subquery bodies are not entered.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Bind(_) | Expr::Variable(_) | Expr::Subquery { .. } => {}
            Expr::Attribute { base, .. } => base.walk(f),
            Expr::Index { base, index } => {
                base.walk(f);
                index.walk(f);
            }
            Expr::Object(fields) => fields.iter().for_each(|(_, e)| e.walk(f)),
            Expr::Array(items) => items.iter().for_each(|e| e.walk(f)),
            Expr::Range(lo, hi) | Expr::Binary(_, lo, hi) => {
                lo.walk(f);
                hi.walk(f);
            }
            Expr::Unary(_, e) => e.walk(f),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                condition.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
            Expr::Call { args, .. } => args.iter().for_each(|e| e.walk(f)),
        }
    }

    /// Subqueries directly inside this expression, outermost only.
    pub fn subqueries(&self) -> Vec<(usize, &Query)> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Subquery { id, query } = e {
                out.push((*id, query.as_ref()));
            }
        });
        out
    }

    /// Splits a conjunction into its operands.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary(BinaryOp::And, l, r) => {
                let mut out = l.conjuncts();
                out.extend(r.conjuncts());
                out
            }
            other => vec![other],
        }
    }
}
