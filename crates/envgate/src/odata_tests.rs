use super::*;

fn req<'a>(
	select: &'a [String],
	filter: Option<&'a str>,
	orderby: Option<&'a str>,
	top: usize,
	skip: usize,
) -> TranslateRequest<'a> {
	TranslateRequest {
		table: "[dbo].[Items]",
		select,
		filter,
		orderby,
		top,
		skip,
	}
}

#[test]
fn plain_projection_and_paging() {
	let select = vec!["ItemCode".to_string(), "Description".to_string()];
	let q = translate(&req(&select, None, None, 3, 0)).unwrap();
	assert_eq!(
		q.sql,
		"SELECT [ItemCode], [Description] FROM [dbo].[Items] ORDER BY 1 \
		OFFSET @p1 ROWS FETCH NEXT @p0 ROWS ONLY"
	);
	assert_eq!(q.bindings, vec![SqlValue::Int(3), SqlValue::Int(0)]);
}

#[test]
fn empty_select_is_star() {
	let q = translate(&req(&[], None, None, 11, 10)).unwrap();
	assert!(q.sql.starts_with("SELECT * FROM [dbo].[Items]"));
	assert_eq!(q.bindings, vec![SqlValue::Int(11), SqlValue::Int(10)]);
}

#[test]
fn string_equality_is_parameterized() {
	let q = translate(&req(&[], Some("Description eq 'Widget'"), None, 11, 0)).unwrap();
	assert!(q.sql.contains("WHERE [Description] = @p0"));
	assert!(!q.sql.contains("Widget"));
	assert_eq!(q.bindings[0], SqlValue::Str("Widget".to_string()));
}

#[test]
fn string_literal_with_spaces_and_escaped_quote() {
	let q = translate(&req(
		&[],
		Some("Description eq 'O''Neil and sons'"),
		None,
		11,
		0,
	))
	.unwrap();
	assert_eq!(q.bindings[0], SqlValue::Str("O'Neil and sons".to_string()));
}

#[test]
fn contains_becomes_like() {
	let q = translate(&req(&[], Some("contains(Description, 'wid')"), None, 11, 0)).unwrap();
	assert!(q.sql.contains("[Description] LIKE '%' + @p0 + '%'"));
	assert_eq!(q.bindings[0], SqlValue::Str("wid".to_string()));
}

#[test]
fn startswith_becomes_prefix_like() {
	let q = translate(&req(&[], Some("startswith(ItemCode, 'A')"), None, 11, 0)).unwrap();
	assert!(q.sql.contains("[ItemCode] LIKE @p0 + '%'"));
}

#[test]
fn integer_comparison() {
	let q = translate(&req(&[], Some("Stock gt 100"), None, 11, 0)).unwrap();
	assert!(q.sql.contains("[Stock] > @p0"));
	assert_eq!(q.bindings[0], SqlValue::Int(100));
}

#[test]
fn conjunction_of_predicates() {
	let q = translate(&req(
		&[],
		Some("Stock gt 0 and Description eq 'Widget' and Price le 50"),
		None,
		11,
		0,
	))
	.unwrap();
	assert!(
		q.sql
			.contains("WHERE [Stock] > @p0 AND [Description] = @p1 AND [Price] <= @p2")
	);
	assert_eq!(q.bindings.len(), 5); // 3 filter params + top + skip
}

#[test]
fn unquoted_string_literal_is_rejected() {
	// S4: `Description eq Hello` — missing quotes must fail closed.
	let err = translate(&req(&[], Some("Description eq Hello"), None, 11, 0)).unwrap_err();
	assert!(matches!(err, ODataError::UnsupportedFilter(_)));
	assert_eq!(err.to_string(), "Unsupported filter expression");
}

#[test]
fn unknown_operator_is_rejected() {
	let err = translate(&req(&[], Some("Description like 'x'"), None, 11, 0)).unwrap_err();
	assert!(matches!(err, ODataError::UnsupportedFilter(_)));
}

#[test]
fn ordering_comparison_on_string_is_rejected() {
	let err = translate(&req(&[], Some("Description gt 'a'"), None, 11, 0)).unwrap_err();
	assert!(matches!(err, ODataError::UnsupportedFilter(_)));
}

#[test]
fn injection_through_identifier_is_rejected() {
	let err = translate(&req(
		&[],
		Some("Name; DROP TABLE Items; -- eq 'x'"),
		None,
		11,
		0,
	))
	.unwrap_err();
	assert!(matches!(
		err,
		ODataError::InvalidIdentifier(_) | ODataError::UnsupportedFilter(_)
	));

	let select = vec!["ItemCode]; DROP TABLE Items; --".to_string()];
	let err = translate(&req(&select, None, None, 11, 0)).unwrap_err();
	assert!(matches!(err, ODataError::InvalidIdentifier(_)));
}

#[test]
fn orderby_directions() {
	let q = translate(&req(
		&[],
		None,
		Some("Description desc, ItemCode"),
		11,
		0,
	))
	.unwrap();
	assert!(q.sql.contains("ORDER BY [Description] DESC, [ItemCode] ASC"));
}

#[test]
fn orderby_garbage_is_rejected() {
	let err = translate(&req(&[], None, Some("Description sideways"), 11, 0)).unwrap_err();
	assert!(matches!(err, ODataError::InvalidOrderBy(_)));
}

#[test]
fn parse_select_validates_each_column() {
	assert_eq!(
		parse_select("ItemCode, Description").unwrap(),
		vec!["ItemCode".to_string(), "Description".to_string()]
	);
	assert!(parse_select("ItemCode, 1=1").is_err());
}

#[test]
fn identifier_rules() {
	assert!(is_identifier("ItemCode"));
	assert!(is_identifier("_private"));
	assert!(is_identifier("Col9"));
	assert!(!is_identifier("9Col"));
	assert!(!is_identifier(""));
	assert!(!is_identifier("a b"));
	assert!(!is_identifier("a-b"));
	assert!(!is_identifier("[x]"));
}

#[test]
fn and_inside_quoted_literal_is_not_a_conjunction() {
	let q = translate(&req(
		&[],
		Some("Description eq 'fish and chips'"),
		None,
		11,
		0,
	))
	.unwrap();
	assert_eq!(q.bindings[0], SqlValue::Str("fish and chips".to_string()));
	assert_eq!(q.bindings.len(), 3);
}
