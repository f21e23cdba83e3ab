//! Value filter expressions
//!
//! Filters are evaluated column-at-a-time against an Arrow `RecordBatch` and
//! produce a selection mask. Comparisons against null yield null, and null
//! rows are never selected.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, NullArray, Scalar, StringArray,
};
use arrow::compute::kernels::cmp;
use arrow::compute::kernels::comparison::{like, nlike};
use arrow::compute::{and_kleene, cast, is_not_null, is_null, not, or_kleene, prep_null_mask_filter};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

use crate::{QueryError, Result};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
}

/// Literal value in a filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl Value {
    /// Single-element Arrow array holding this literal
    fn to_array(&self) -> ArrayRef {
        match self {
            Value::Null => Arc::new(NullArray::new(1)),
            Value::Bool(b) => Arc::new(BooleanArray::from(vec![*b])),
            Value::Int64(v) => Arc::new(Int64Array::from(vec![*v])),
            Value::Float64(v) => Arc::new(Float64Array::from(vec![*v])),
            Value::String(s) => Arc::new(StringArray::from(vec![s.as_str()])),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A filter condition
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Always true
    True,
    /// Always false
    False,
    /// Compare field to value
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// SQL LIKE pattern match (`%` and `_` wildcards)
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
    /// IN list
    In {
        field: String,
        values: Vec<Value>,
    },
    /// IS NULL / IS NOT NULL
    IsNull {
        field: String,
        negated: bool,
    },
    /// AND combination
    And(Vec<Filter>),
    /// OR combination
    Or(Vec<Filter>),
    /// NOT
    Not(Box<Filter>),
}

impl Filter {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Equal, value)
    }

    pub fn is_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            f => Filter::And(vec![f, other]),
        }
    }

    /// Parse a textual filter, e.g. `label == 'A' and n_genes > 100`.
    pub fn parse(text: &str) -> Result<Self> {
        FilterParser::parse(text)
    }

    /// Evaluate into a three-valued mask (null where the outcome is unknown).
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let rows = batch.num_rows();
        match self {
            Filter::True => Ok(BooleanArray::from(vec![true; rows])),
            Filter::False => Ok(BooleanArray::from(vec![false; rows])),
            Filter::Compare { field, op, value } => {
                let column = logical_column(batch, field)?;
                compare_column(&column, *op, value)
            }
            Filter::Like {
                field,
                pattern,
                negated,
            } => {
                let column = logical_column(batch, field)?;
                let pattern = cast(&Value::String(pattern.clone()).to_array(), column.data_type())?;
                let pattern = Scalar::new(pattern);
                let mask = if *negated {
                    nlike(&column, &pattern)?
                } else {
                    like(&column, &pattern)?
                };
                Ok(mask)
            }
            Filter::In { field, values } => {
                let column = logical_column(batch, field)?;
                let mut mask = BooleanArray::from(vec![false; rows]);
                for value in values {
                    let hit = compare_column(&column, CompareOp::Equal, value)?;
                    mask = or_kleene(&mask, &hit)?;
                }
                Ok(mask)
            }
            Filter::IsNull { field, negated } => {
                let column = column_by_name(batch, field)?;
                let mask = if *negated {
                    is_not_null(column.as_ref())?
                } else {
                    is_null(column.as_ref())?
                };
                Ok(mask)
            }
            Filter::And(filters) => {
                let mut mask = BooleanArray::from(vec![true; rows]);
                for filter in filters {
                    mask = and_kleene(&mask, &filter.evaluate(batch)?)?;
                }
                Ok(mask)
            }
            Filter::Or(filters) => {
                let mut mask = BooleanArray::from(vec![false; rows]);
                for filter in filters {
                    mask = or_kleene(&mask, &filter.evaluate(batch)?)?;
                }
                Ok(mask)
            }
            Filter::Not(filter) => Ok(not(&filter.evaluate(batch)?)?),
        }
    }

    /// Evaluate into a selection mask with unknown outcomes treated as false.
    pub fn select(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let mask = self.evaluate(batch)?;
        if mask.null_count() == 0 {
            Ok(mask)
        } else {
            Ok(prep_null_mask_filter(&mask))
        }
    }
}

fn column_by_name<'a>(batch: &'a RecordBatch, field: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(field)
        .ok_or_else(|| QueryError::ColumnNotFound(field.to_string()))
}

/// Column with dictionary encoding resolved to its value type.
fn logical_column(batch: &RecordBatch, field: &str) -> Result<ArrayRef> {
    let column = column_by_name(batch, field)?;
    match column.data_type() {
        DataType::Dictionary(_, value_type) => Ok(cast(column, value_type)?),
        _ => Ok(column.clone()),
    }
}

fn compare_column(column: &ArrayRef, op: CompareOp, value: &Value) -> Result<BooleanArray> {
    if matches!(value, Value::Null) {
        return Ok(BooleanArray::new_null(column.len()));
    }

    // Integer column against a fractional literal compares as floats
    let (column, literal) = match (column.data_type(), value) {
        (dt, Value::Float64(_)) if dt.is_integer() => {
            (cast(column, &DataType::Float64)?, value.to_array())
        }
        (dt, _) => (column.clone(), cast(&value.to_array(), dt)?),
    };
    let literal = Scalar::new(literal);

    let mask = match op {
        CompareOp::Equal => cmp::eq(&column, &literal)?,
        CompareOp::NotEqual => cmp::neq(&column, &literal)?,
        CompareOp::LessThan => cmp::lt(&column, &literal)?,
        CompareOp::LessEqual => cmp::lt_eq(&column, &literal)?,
        CompareOp::GreaterThan => cmp::gt(&column, &literal)?,
        CompareOp::GreaterEqual => cmp::gt_eq(&column, &literal)?,
    };
    Ok(mask)
}

// ============================================================================
// Text parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    In,
    Like,
    Is,
    Null,
    True,
    False,
    LParen,
    RParen,
    Comma,
    Minus,
    Op(CompareOp),
    Identifier(String),
    StringLit(String),
    IntLit(i64),
    FloatLit(f64),
    Eof,
}

struct FilterParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl FilterParser {
    fn parse(text: &str) -> Result<Filter> {
        let tokens = Self::tokenize(text)?;
        let mut parser = FilterParser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        match parser.current() {
            Token::Eof => Ok(filter),
            tok => Err(QueryError::FilterParse(format!(
                "Unexpected trailing token {:?}",
                tok
            ))),
        }
    }

    fn tokenize(text: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut i = 0;

        while i < len {
            let c = chars[i];

            if c.is_whitespace() {
                i += 1;
                continue;
            }

            match c {
                '(' => { tokens.push(Token::LParen); i += 1; continue; }
                ')' => { tokens.push(Token::RParen); i += 1; continue; }
                ',' => { tokens.push(Token::Comma); i += 1; continue; }
                '-' => { tokens.push(Token::Minus); i += 1; continue; }
                _ => {}
            }

            let next = chars.get(i + 1).copied();
            match (c, next) {
                ('=', Some('=')) => { tokens.push(Token::Op(CompareOp::Equal)); i += 2; continue; }
                ('=', _) => { tokens.push(Token::Op(CompareOp::Equal)); i += 1; continue; }
                ('!', Some('=')) | ('<', Some('>')) => {
                    tokens.push(Token::Op(CompareOp::NotEqual));
                    i += 2;
                    continue;
                }
                ('<', Some('=')) => { tokens.push(Token::Op(CompareOp::LessEqual)); i += 2; continue; }
                ('<', _) => { tokens.push(Token::Op(CompareOp::LessThan)); i += 1; continue; }
                ('>', Some('=')) => { tokens.push(Token::Op(CompareOp::GreaterEqual)); i += 2; continue; }
                ('>', _) => { tokens.push(Token::Op(CompareOp::GreaterThan)); i += 1; continue; }
                _ => {}
            }

            if c == '\'' || c == '"' {
                let quote = c;
                i += 1;
                let mut s = String::new();
                while i < len && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < len {
                        i += 1;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= len {
                    return Err(QueryError::FilterParse("Unterminated string literal".to_string()));
                }
                i += 1;
                tokens.push(Token::StringLit(s));
                continue;
            }

            if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
                let start = i;
                let mut has_dot = false;
                while i < len && (chars[i].is_ascii_digit() || (!has_dot && chars[i] == '.')) {
                    if chars[i] == '.' {
                        has_dot = true;
                    }
                    i += 1;
                }
                let num: String = chars[start..i].iter().collect();
                let token = if has_dot {
                    num.parse()
                        .map(Token::FloatLit)
                        .map_err(|_| QueryError::FilterParse(format!("Invalid number: {}", num)))?
                } else {
                    num.parse()
                        .map(Token::IntLit)
                        .map_err(|_| QueryError::FilterParse(format!("Invalid number: {}", num)))?
                };
                tokens.push(token);
                continue;
            }

            if c.is_alphabetic() || c == '_' {
                let start = i;
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "like" => Token::Like,
                    "is" => Token::Is,
                    "null" | "none" => Token::Null,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Identifier(word),
                };
                tokens.push(token);
                continue;
            }

            return Err(QueryError::FilterParse(format!("Unexpected character: {}", c)));
        }

        tokens.push(Token::Eof);
        Ok(tokens)
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if *self.current() == expected {
            self.advance();
            Ok(())
        } else {
            Err(QueryError::FilterParse(format!(
                "Expected {:?}, got {:?}",
                expected,
                self.current()
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Filter> {
        let mut terms = vec![self.parse_and()?];
        while matches!(self.current(), Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Filter::Or(terms) })
    }

    fn parse_and(&mut self) -> Result<Filter> {
        let mut terms = vec![self.parse_not()?];
        while matches!(self.current(), Token::And) {
            self.advance();
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Filter::And(terms) })
    }

    fn parse_not(&mut self) -> Result<Filter> {
        if matches!(self.current(), Token::Not) {
            self.advance();
            let inner = self.parse_not()?;
            Ok(Filter::Not(Box::new(inner)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Filter> {
        match self.advance() {
            Token::LParen => {
                let filter = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(filter)
            }
            Token::True => Ok(Filter::True),
            Token::False => Ok(Filter::False),
            Token::Identifier(field) => self.parse_predicate(field),
            tok => Err(QueryError::FilterParse(format!(
                "Unexpected token in expression: {:?}",
                tok
            ))),
        }
    }

    fn parse_predicate(&mut self, field: String) -> Result<Filter> {
        match self.advance() {
            Token::Op(op) => {
                let value = self.parse_literal()?;
                Ok(Filter::Compare { field, op, value })
            }
            Token::In => {
                let values = self.parse_literal_list()?;
                Ok(Filter::In { field, values })
            }
            Token::Like => {
                let pattern = self.parse_pattern()?;
                Ok(Filter::Like { field, pattern, negated: false })
            }
            Token::Is => {
                let negated = matches!(self.current(), Token::Not);
                if negated {
                    self.advance();
                }
                self.expect(Token::Null)?;
                Ok(Filter::IsNull { field, negated })
            }
            Token::Not => match self.advance() {
                Token::In => {
                    let values = self.parse_literal_list()?;
                    Ok(Filter::Not(Box::new(Filter::In { field, values })))
                }
                Token::Like => {
                    let pattern = self.parse_pattern()?;
                    Ok(Filter::Like { field, pattern, negated: true })
                }
                tok => Err(QueryError::FilterParse(format!(
                    "Expected IN or LIKE after NOT, got {:?}",
                    tok
                ))),
            },
            tok => Err(QueryError::FilterParse(format!(
                "Expected operator after '{}', got {:?}",
                field, tok
            ))),
        }
    }

    fn parse_pattern(&mut self) -> Result<String> {
        match self.advance() {
            Token::StringLit(s) => Ok(s),
            tok => Err(QueryError::FilterParse(format!(
                "LIKE requires a string pattern, got {:?}",
                tok
            ))),
        }
    }

    fn parse_literal_list(&mut self) -> Result<Vec<Value>> {
        self.expect(Token::LParen)?;
        let mut values = Vec::new();
        if matches!(self.current(), Token::RParen) {
            self.advance();
            return Ok(values);
        }
        loop {
            values.push(self.parse_literal()?);
            if matches!(self.current(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(values)
    }

    fn parse_literal(&mut self) -> Result<Value> {
        match self.advance() {
            Token::StringLit(s) => Ok(Value::String(s)),
            Token::IntLit(n) => Ok(Value::Int64(n)),
            Token::FloatLit(f) => Ok(Value::Float64(f)),
            Token::True => Ok(Value::Bool(true)),
            Token::False => Ok(Value::Bool(false)),
            Token::Null => Ok(Value::Null),
            Token::Minus => match self.advance() {
                Token::IntLit(n) => Ok(Value::Int64(-n)),
                Token::FloatLit(f) => Ok(Value::Float64(-f)),
                tok => Err(QueryError::FilterParse(format!(
                    "Expected number after '-', got {:?}",
                    tok
                ))),
            },
            tok => Err(QueryError::FilterParse(format!("Expected literal, got {:?}", tok))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{DictionaryArray, Int32Array};
    use arrow::datatypes::{Field, Int32Type, Schema};

    fn make_batch() -> RecordBatch {
        let label: DictionaryArray<Int32Type> =
            vec!["A", "B", "A", "C"].into_iter().collect();
        let schema = Schema::new(vec![
            Field::new("soma_joinid", DataType::Int64, false),
            Field::new("n_genes", DataType::Int32, true),
            Field::new("label", label.data_type().clone(), false),
            Field::new("name", DataType::Utf8, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(vec![0, 1, 2, 3])),
                Arc::new(Int32Array::from(vec![Some(10), None, Some(300), Some(50)])),
                Arc::new(label),
                Arc::new(StringArray::from(vec![
                    Some("cell_a"),
                    Some("cell_b"),
                    None,
                    Some("other"),
                ])),
            ],
        )
        .unwrap()
    }

    fn selected(filter: &Filter) -> Vec<bool> {
        filter.select(&make_batch()).unwrap().iter().map(|v| v.unwrap()).collect()
    }

    #[test]
    fn test_compare_on_dictionary_column() {
        assert_eq!(selected(&Filter::eq("label", "A")), vec![true, false, true, false]);
    }

    #[test]
    fn test_compare_null_is_not_selected() {
        let filter = Filter::compare("n_genes", CompareOp::GreaterThan, 20i64);
        assert_eq!(selected(&filter), vec![false, false, true, true]);

        let negated = Filter::Not(Box::new(filter));
        assert_eq!(selected(&negated), vec![true, false, false, false]);
    }

    #[test]
    fn test_integer_column_against_float_literal() {
        let filter = Filter::compare("n_genes", CompareOp::GreaterEqual, 49.5);
        assert_eq!(selected(&filter), vec![false, false, true, true]);
    }

    #[test]
    fn test_in_and_like() {
        assert_eq!(selected(&Filter::is_in("label", ["B", "C"])), vec![false, true, false, true]);

        let like = Filter::Like {
            field: "name".to_string(),
            pattern: "cell%".to_string(),
            negated: false,
        };
        assert_eq!(selected(&like), vec![true, true, false, false]);
    }

    #[test]
    fn test_missing_column() {
        let err = Filter::eq("nope", 1i64).select(&make_batch()).unwrap_err();
        assert!(matches!(err, QueryError::ColumnNotFound(ref c) if c == "nope"));
    }

    #[test]
    fn test_parse_simple_and_compound() {
        assert_eq!(Filter::parse("label == 'A'").unwrap(), Filter::eq("label", "A"));

        let parsed = Filter::parse("label in ('A', 'B')").unwrap();
        assert_eq!(parsed, Filter::is_in("label", ["A", "B"]));

        let parsed = Filter::parse("n_genes > 20 and (label = 'A' or name is null)").unwrap();
        assert_eq!(selected(&parsed), vec![false, false, true, false]);

        let parsed = Filter::parse("n_genes >= -1 and not label like 'C%'").unwrap();
        assert_eq!(selected(&parsed), vec![true, false, true, false]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Filter::parse("label =="), Err(QueryError::FilterParse(_))));
        assert!(matches!(Filter::parse("label == 'A"), Err(QueryError::FilterParse(_))));
        assert!(matches!(Filter::parse("(label == 'A'"), Err(QueryError::FilterParse(_))));
        assert!(matches!(Filter::parse("label == 'A' 3"), Err(QueryError::FilterParse(_))));
    }
}
