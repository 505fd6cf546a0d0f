//! OData query options to parameterized T-SQL.
//!
//! `translate` is a pure function: table + query options in, SQL text plus an
//! ordered binding list out. Literal values never appear in the SQL string —
//! every value rides in a `@pN` binding. The filter grammar is a deliberate
//! subset; anything the parser does not recognise fails closed with
//! `UnsupportedFilter`.

use crate::*;

#[cfg(test)]
#[path = "odata_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ODataError {
	#[error("Invalid column name `{0}`")]
	InvalidIdentifier(String),

	#[error("Unsupported filter expression")]
	UnsupportedFilter(String),

	#[error("Invalid $orderby expression `{0}`")]
	InvalidOrderBy(String),

	#[error("Invalid integer literal `{0}`")]
	InvalidInteger(String),
}

/// One positional binding; `@p0` refers to `bindings[0]`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
	Str(String),
	Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
	pub sql: String,
	pub bindings: Vec<SqlValue>,
}

#[derive(Debug, Clone)]
pub struct TranslateRequest<'a> {
	/// Already bracket-qualified, e.g. `[dbo].[Items]`.
	pub table: &'a str,
	/// Projection; empty means `*`.
	pub select: &'a [String],
	pub filter: Option<&'a str>,
	pub orderby: Option<&'a str>,
	pub top: usize,
	pub skip: usize,
}

pub fn translate(req: &TranslateRequest) -> Result<SqlQuery, ODataError> {
	let mut bindings = Vec::new();

	let projection = if req.select.is_empty() {
		"*".to_string()
	} else {
		req
			.select
			.iter()
			.map(|c| bracket(c))
			.collect::<Result<Vec<_>, _>>()?
			.join(", ")
	};

	let where_clause = match req.filter {
		Some(filter) if !filter.trim().is_empty() => {
			let predicates = parse_filter(filter, &mut bindings)?;
			format!(" WHERE {predicates}")
		},
		_ => String::new(),
	};

	let order_clause = match req.orderby {
		Some(orderby) if !orderby.trim().is_empty() => parse_orderby(orderby)?,
		// OFFSET/FETCH requires an ORDER BY; ordinal 1 keeps the page stable
		// enough without knowing the table's columns.
		_ => "1".to_string(),
	};

	let top_param = push(&mut bindings, SqlValue::Int(req.top as i64));
	let skip_param = push(&mut bindings, SqlValue::Int(req.skip as i64));

	let sql = format!(
		"SELECT {projection} FROM {table}{where_clause} ORDER BY {order_clause} \
		OFFSET {skip_param} ROWS FETCH NEXT {top_param} ROWS ONLY",
		table = req.table,
	);
	Ok(SqlQuery { sql, bindings })
}

fn push(bindings: &mut Vec<SqlValue>, value: SqlValue) -> String {
	let name = format!("@p{}", bindings.len());
	bindings.push(value);
	name
}

/// `A and B and ...` over the supported predicate forms.
fn parse_filter(filter: &str, bindings: &mut Vec<SqlValue>) -> Result<String, ODataError> {
	let mut predicates = Vec::new();
	for clause in split_and(filter) {
		predicates.push(parse_predicate(clause.trim(), bindings)?);
	}
	if predicates.is_empty() {
		return Err(ODataError::UnsupportedFilter(filter.to_string()));
	}
	Ok(predicates.join(" AND "))
}

fn split_and(filter: &str) -> Vec<&str> {
	// ` and ` never occurs inside our literals unquoted; quoted literals are
	// handled by scanning for quote state.
	let mut parts = Vec::new();
	let bytes = filter.as_bytes();
	let mut start = 0;
	let mut in_quote = false;
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'\'' => in_quote = !in_quote,
			b' ' if !in_quote => {
				let rest = &filter[i..];
				if rest
					.get(..5)
					.is_some_and(|head| head.eq_ignore_ascii_case(" and "))
				{
					parts.push(&filter[start..i]);
					start = i + 5;
					i += 4;
				}
			},
			_ => {},
		}
		i += 1;
	}
	parts.push(&filter[start..]);
	parts
}

fn parse_predicate(clause: &str, bindings: &mut Vec<SqlValue>) -> Result<String, ODataError> {
	if let Some(inner) = function_call(clause, "contains") {
		let (field, literal) = parse_function_args(clause, inner)?;
		let field = bracket(&field)?;
		let param = push(bindings, SqlValue::Str(literal));
		return Ok(format!("{field} LIKE '%' + {param} + '%'"));
	}
	if let Some(inner) = function_call(clause, "startswith") {
		let (field, literal) = parse_function_args(clause, inner)?;
		let field = bracket(&field)?;
		let param = push(bindings, SqlValue::Str(literal));
		return Ok(format!("{field} LIKE {param} + '%'"));
	}

	// `Field op value`; the value may contain spaces when quoted.
	let (field, rest) = clause
		.split_once(' ')
		.ok_or_else(|| ODataError::UnsupportedFilter(clause.to_string()))?;
	let (op, value) = rest
		.trim()
		.split_once(' ')
		.ok_or_else(|| ODataError::UnsupportedFilter(clause.to_string()))?;
	let field = bracket(field.trim())?;
	let value = value.trim();

	let sql_op = match op.trim() {
		"eq" => "=",
		"ne" => "<>",
		"gt" => ">",
		"ge" => ">=",
		"lt" => "<",
		"le" => "<=",
		_ => return Err(ODataError::UnsupportedFilter(clause.to_string())),
	};

	if let Some(literal) = string_literal(value) {
		// String comparison only makes sense for (in)equality.
		if sql_op != "=" && sql_op != "<>" {
			return Err(ODataError::UnsupportedFilter(clause.to_string()));
		}
		let param = push(bindings, SqlValue::Str(literal));
		return Ok(format!("{field} {sql_op} {param}"));
	}

	let int: i64 = value
		.parse()
		.map_err(|_| ODataError::UnsupportedFilter(clause.to_string()))?;
	let param = push(bindings, SqlValue::Int(int));
	Ok(format!("{field} {sql_op} {param}"))
}

fn function_call<'a>(clause: &'a str, name: &str) -> Option<&'a str> {
	let clause = clause.trim();
	if !clause
		.get(..name.len())
		.is_some_and(|head| head.eq_ignore_ascii_case(name))
	{
		return None;
	}
	let rest = clause[name.len()..].trim_start();
	let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
	Some(inner)
}

fn parse_function_args(clause: &str, inner: &str) -> Result<(String, String), ODataError> {
	let (field, literal) = inner
		.split_once(',')
		.ok_or_else(|| ODataError::UnsupportedFilter(clause.to_string()))?;
	let literal = string_literal(literal.trim())
		.ok_or_else(|| ODataError::UnsupportedFilter(clause.to_string()))?;
	Ok((field.trim().to_string(), literal))
}

/// `'abc'` with `''` as the escaped quote, per OData.
fn string_literal(value: &str) -> Option<String> {
	let inner = value.strip_prefix('\'')?.strip_suffix('\'')?;
	Some(inner.replace("''", "'"))
}

fn parse_orderby(orderby: &str) -> Result<String, ODataError> {
	let mut terms = Vec::new();
	for term in orderby.split(',') {
		let term = term.trim();
		if term.is_empty() {
			return Err(ODataError::InvalidOrderBy(orderby.to_string()));
		}
		let mut parts = term.split_whitespace();
		let field = parts
			.next()
			.ok_or_else(|| ODataError::InvalidOrderBy(orderby.to_string()))?;
		let direction = match parts.next() {
			None => "ASC",
			Some(d) if d.eq_ignore_ascii_case("asc") => "ASC",
			Some(d) if d.eq_ignore_ascii_case("desc") => "DESC",
			Some(_) => return Err(ODataError::InvalidOrderBy(orderby.to_string())),
		};
		if parts.next().is_some() {
			return Err(ODataError::InvalidOrderBy(orderby.to_string()));
		}
		terms.push(format!("{} {direction}", bracket(field)?));
	}
	Ok(terms.join(", "))
}

/// Wraps a validated identifier in brackets. Everything that is not a plain
/// identifier is rejected, which is what keeps `$select`/`$orderby` free of
/// injection.
pub fn bracket(identifier: &str) -> Result<String, ODataError> {
	if is_identifier(identifier) {
		Ok(format!("[{identifier}]"))
	} else {
		Err(ODataError::InvalidIdentifier(identifier.to_string()))
	}
}

pub fn is_identifier(s: &str) -> bool {
	let mut chars = s.chars();
	match chars.next() {
		Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
		_ => return false,
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a `$select` list into validated column names.
pub fn parse_select(select: &str) -> Result<Vec<String>, ODataError> {
	select
		.split(',')
		.map(|c| c.trim())
		.filter(|c| !c.is_empty())
		.map(|c| {
			if is_identifier(c) {
				Ok(c.to_string())
			} else {
				Err(ODataError::InvalidIdentifier(c.to_string()))
			}
		})
		.collect()
}
