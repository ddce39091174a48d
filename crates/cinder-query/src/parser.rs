use bson::Bson;

use crate::ast::{
    BinaryOp, Clause, CollectionRef, Expr, ForClause, ForSource, LimitClause, Modification,
    ModificationKind, Query, UnaryOp,
};
use crate::error::QueryError;
use crate::lexer::{self, Keyword, Spanned, Token};

/// Parse query text into a [`Query`].
///
/// Supported statements:
/// - `RETURN expr`
/// - `[FOR v IN source] [FILTER e | LET v = e]* [LIMIT [offset,] count]
///   [modification] [COLLECT WITH COUNT INTO v] [RETURN e]`
/// - modifications: `INSERT`, `UPDATE [.. WITH]`, `REPLACE [.. WITH]`,
///   `REMOVE` and `UPSERT .. INSERT .. UPDATE|REPLACE`, each `IN`/`INTO` a
///   collection, with optional `OPTIONS {..}`
/// - `(query)` anywhere an expression is expected
///
/// A bare identifier after `FOR v IN` names a collection unless it is a
/// variable already in scope.
pub fn parse(input: &str) -> Result<Query, QueryError> {
    let tokens = lexer::tokenize(input)?;
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
        scope: Vec::new(),
        no_in: false,
        subqueries: 0,
    };
    let query = parser.query()?;
    parser.expect(Token::Eof, "end of query")?;
    Ok(query)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    /// Variables visible at the current position.
    scope: Vec<String>,
    /// Set while parsing the operands of a modification, where `IN` names
    /// the collection instead of testing membership.
    no_in: bool,
    /// Subqueries numbered so far.
    subqueries: usize,
}

impl<'a> Parser<'a> {
    // ── Token helpers ───────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    /// Steps back over a token taken with [`Parser::advance`].
    fn unadvance(&mut self, token: &Token) {
        if *token != Token::Eof {
            self.pos -= 1;
        }
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek(), Token::Keyword(k) if *k == kw)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), QueryError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<(), QueryError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("keyword {}", kw.as_str().to_uppercase())))
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String, QueryError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn unexpected(&self, expected: &str) -> QueryError {
        let found = match self.peek() {
            Token::Eof => "end of query".to_string(),
            other => format!("{other:?}"),
        };
        lexer::error_at(
            self.input,
            self.tokens[self.pos].offset,
            &format!("unexpected {found}, expecting {expected}"),
        )
    }

    // ── Statements ──────────────────────────────────────────────

    fn query(&mut self) -> Result<Query, QueryError> {
        let outer_scope = self.scope.len();
        let mut query = Query {
            for_clause: None,
            clauses: Vec::new(),
            limit: None,
            modification: None,
            count_into: None,
            ret: None,
        };

        if self.eat_keyword(Keyword::For) {
            let variable = self.identifier("loop variable name")?;
            self.expect_keyword(Keyword::In)?;
            let source = self.for_source()?;
            self.declare(&variable)?;
            query.for_clause = Some(ForClause { variable, source });
        }

        loop {
            if self.eat_keyword(Keyword::Filter) {
                if query.limit.is_some() {
                    return Err(self.unexpected("no FILTER after LIMIT"));
                }
                query.clauses.push(Clause::Filter(self.expression()?));
            } else if self.eat_keyword(Keyword::Let) {
                if query.limit.is_some() {
                    return Err(self.unexpected("no LET after LIMIT"));
                }
                let variable = self.identifier("variable name")?;
                self.expect(Token::Assign, "'='")?;
                let value = self.expression()?;
                self.declare(&variable)?;
                query.clauses.push(Clause::Let { variable, value });
            } else if self.eat_keyword(Keyword::Limit) {
                if query.limit.is_some() {
                    return Err(self.unexpected("a single LIMIT"));
                }
                let first = self.expression()?;
                query.limit = Some(if self.eat(&Token::Comma) {
                    LimitClause {
                        offset: Some(first),
                        count: self.expression()?,
                    }
                } else {
                    LimitClause {
                        offset: None,
                        count: first,
                    }
                });
            } else {
                break;
            }
        }

        query.modification = self.modification()?;
        if let Some(m) = &query.modification {
            // OLD is null for inserts that do not overwrite.
            self.scope.push("OLD".into());
            if !matches!(m.kind, ModificationKind::Remove { .. }) {
                self.scope.push("NEW".into());
            }
        }

        if self.eat_keyword(Keyword::Collect) {
            self.expect_keyword(Keyword::With)?;
            self.expect_keyword(Keyword::Count)?;
            if !self.eat_keyword(Keyword::Into) {
                self.expect_keyword(Keyword::In)?;
            }
            let var = self.identifier("variable name")?;
            // COLLECT hides everything declared before it.
            self.scope.truncate(outer_scope);
            self.scope.push(var.clone());
            query.count_into = Some(var);
        }

        if self.eat_keyword(Keyword::Return) {
            query.ret = Some(self.expression()?);
        }

        self.scope.truncate(outer_scope);

        if query.for_clause.is_none()
            && query.modification.is_none()
            && query.ret.is_none()
        {
            return Err(self.unexpected("FOR, RETURN or a data-modification statement"));
        }
        Ok(query)
    }

    fn declare(&mut self, variable: &str) -> Result<(), QueryError> {
        if self.scope.iter().any(|v| v == variable) {
            return Err(QueryError::VariableRedeclared(variable.to_string()));
        }
        self.scope.push(variable.to_string());
        Ok(())
    }

    fn for_source(&mut self) -> Result<ForSource, QueryError> {
        match self.peek().clone() {
            Token::Ident(name)
                if !self.scope.contains(&name)
                    && !matches!(self.tokens[self.pos + 1].token, Token::LParen | Token::Dot) =>
            {
                self.advance();
                Ok(ForSource::Collection(CollectionRef::Name(name)))
            }
            Token::CollectionBind(name) => {
                self.advance();
                Ok(ForSource::Collection(CollectionRef::Bind(name)))
            }
            _ => Ok(ForSource::Expr(self.expression()?)),
        }
    }

    fn modification(&mut self) -> Result<Option<Modification>, QueryError> {
        let kind = if self.eat_keyword(Keyword::Insert) {
            ModificationKind::Insert {
                document: self.operand()?,
            }
        } else if self.eat_keyword(Keyword::Update) {
            let (key, document) = self.key_with_document()?;
            ModificationKind::Update { key, document }
        } else if self.eat_keyword(Keyword::Replace) {
            let (key, document) = self.key_with_document()?;
            ModificationKind::Replace { key, document }
        } else if self.eat_keyword(Keyword::Remove) {
            ModificationKind::Remove {
                key: self.operand()?,
            }
        } else if self.eat_keyword(Keyword::Upsert) {
            self.upsert()?
        } else {
            return Ok(None);
        };

        if !self.eat_keyword(Keyword::In) {
            self.expect_keyword(Keyword::Into)?;
        }
        let collection = self.collection_ref()?;
        let options = if self.eat_keyword(Keyword::Options) {
            Some(self.expression()?)
        } else {
            None
        };
        Ok(Some(Modification {
            kind,
            collection,
            options,
        }))
    }

    fn key_with_document(&mut self) -> Result<(Option<Expr>, Expr), QueryError> {
        let first = self.operand()?;
        if self.eat_keyword(Keyword::With) {
            Ok((Some(first), self.operand()?))
        } else {
            Ok((None, first))
        }
    }

    fn upsert(&mut self) -> Result<ModificationKind, QueryError> {
        let search = self.operand()?;
        self.expect_keyword(Keyword::Insert)?;
        let insert = self.operand()?;
        let replace = if self.eat_keyword(Keyword::Replace) {
            true
        } else {
            self.expect_keyword(Keyword::Update)?;
            false
        };
        // The update body sees the document found by the search.
        self.scope.push("OLD".into());
        let update = self.operand();
        self.scope.pop();
        Ok(ModificationKind::Upsert {
            search,
            insert,
            update: update?,
            replace,
        })
    }

    /// An expression in front of `IN collection`.
    fn operand(&mut self) -> Result<Expr, QueryError> {
        let outer = std::mem::replace(&mut self.no_in, true);
        let expr = self.expression();
        self.no_in = outer;
        expr
    }

    /// Runs `f` with the `IN` operator available again, for bracketed
    /// sub-expressions.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        let outer = std::mem::replace(&mut self.no_in, false);
        let result = f(self);
        self.no_in = outer;
        result
    }

    fn collection_ref(&mut self) -> Result<CollectionRef, QueryError> {
        match self.advance() {
            Token::Ident(name) => Ok(CollectionRef::Name(name)),
            Token::CollectionBind(name) => Ok(CollectionRef::Bind(name)),
            other => {
                self.unadvance(&other);
                Err(self.unexpected("collection name"))
            }
        }
    }

    // ── Expressions ─────────────────────────────────────────────

    fn expression(&mut self) -> Result<Expr, QueryError> {
        let condition = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(Token::Colon, "':'")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(condition)
    }

    fn or(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Keyword(Keyword::In) if !self.no_in => BinaryOp::In,
                Token::Keyword(Keyword::Not)
                    if !self.no_in
                        && self.tokens[self.pos + 1].token == Token::Keyword(Keyword::In) =>
                {
                    self.advance();
                    BinaryOp::NotIn
                }
                _ => break,
            };
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.range()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.range()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn range(&mut self) -> Result<Expr, QueryError> {
        let low = self.additive()?;
        if self.eat(&Token::Range) {
            let high = self.additive()?;
            return Ok(Expr::Range(Box::new(low), Box::new(high)));
        }
        Ok(low)
    }

    fn additive(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, QueryError> {
        if self.eat(&Token::Not) || self.eat_keyword(Keyword::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(match self.unary()? {
                Expr::Literal(Bson::Int64(n)) => Expr::Literal(Bson::Int64(-n)),
                Expr::Literal(Bson::Double(n)) => Expr::Literal(Bson::Double(-n)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, QueryError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.attribute_name()?;
                expr = Expr::Attribute {
                    base: Box::new(expr),
                    name,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.nested(Self::expression)?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn attribute_name(&mut self) -> Result<String, QueryError> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            Token::Keyword(kw) => Ok(kw.as_str().to_string()),
            other => {
                self.unadvance(&other);
                Err(self.unexpected("attribute name"))
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, QueryError> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::Literal(Bson::Int64(n))),
            Token::Float(n) => Ok(Expr::Literal(Bson::Double(n))),
            Token::String(s) => Ok(Expr::Literal(Bson::String(s))),
            Token::Keyword(Keyword::Null) => Ok(Expr::Literal(Bson::Null)),
            Token::Keyword(Keyword::True) => Ok(Expr::Literal(Bson::Boolean(true))),
            Token::Keyword(Keyword::False) => Ok(Expr::Literal(Bson::Boolean(false))),
            Token::Bind(name) => Ok(Expr::Bind(name)),
            Token::LBrace => self.nested(Self::object),
            Token::LBracket => self.nested(Self::array),
            Token::LParen => {
                let expr = self.nested(|p| {
                    if matches!(
                        p.peek(),
                        Token::Keyword(
                            Keyword::For
                                | Keyword::Let
                                | Keyword::Insert
                                | Keyword::Update
                                | Keyword::Replace
                                | Keyword::Remove
                                | Keyword::Upsert
                                | Keyword::Return
                        )
                    ) {
                        let id = p.subqueries;
                        p.subqueries += 1;
                        Ok(Expr::Subquery {
                            id,
                            query: Box::new(p.query()?),
                        })
                    } else {
                        p.expression()
                    }
                })?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.nested(Self::arguments)?;
                    return Ok(Expr::Call {
                        name: name.to_ascii_uppercase(),
                        args,
                    });
                }
                if !self.scope.contains(&name) {
                    return Err(QueryError::VariableUnknown(name));
                }
                Ok(Expr::Variable(name))
            }
            other => {
                self.unadvance(&other);
                Err(self.unexpected("an expression"))
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, QueryError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma, "',' or ')'")?;
        }
    }

    fn object(&mut self) -> Result<Expr, QueryError> {
        let mut fields = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Object(fields));
        }
        loop {
            let name = match self.advance() {
                Token::Ident(name) | Token::String(name) => name,
                Token::Keyword(kw) => kw.as_str().to_string(),
                other => {
                    self.unadvance(&other);
                    return Err(self.unexpected("attribute name"));
                }
            };
            let value = if self.eat(&Token::Colon) {
                self.expression()?
            } else if self.scope.contains(&name) {
                // `{ d }` is shorthand for `{ d: d }`.
                Expr::Variable(name.clone())
            } else {
                return Err(self.unexpected("':'"));
            };
            fields.push((name, value));
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Object(fields));
            }
            self.expect(Token::Comma, "',' or '}'")?;
            // Trailing comma.
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Object(fields));
            }
        }
    }

    fn array(&mut self) -> Result<Expr, QueryError> {
        let mut items = Vec::new();
        if self.eat(&Token::RBracket) {
            return Ok(Expr::Array(items));
        }
        loop {
            items.push(self.expression()?);
            if self.eat(&Token::RBracket) {
                return Ok(Expr::Array(items));
            }
            self.expect(Token::Comma, "',' or ']'")?;
            if self.eat(&Token::RBracket) {
                return Ok(Expr::Array(items));
            }
        }
    }
}
