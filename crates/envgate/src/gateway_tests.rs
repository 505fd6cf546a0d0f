use super::*;

#[test]
fn scope_targets_follow_the_route_table() {
	assert_eq!(
		parse_scope_target("/api/prod/Products"),
		(Some("prod"), Some("Products".to_string()))
	);
	assert_eq!(
		parse_scope_target("/api/prod/Products/AB-12"),
		(Some("prod"), Some("Products".to_string()))
	);
	assert_eq!(
		parse_scope_target("/api/600/composite/SalesOrder"),
		(Some("600"), Some("composite/SalesOrder".to_string()))
	);
	assert_eq!(
		parse_scope_target("/webhook/prod/orders"),
		(Some("prod"), Some("webhook/orders".to_string()))
	);
	assert_eq!(parse_scope_target("/health"), (None, None));
	assert_eq!(parse_scope_target("/"), (None, None));
}

#[test]
fn error_statuses_match_the_contract() {
	let cases: Vec<(GatewayError, StatusCode)> = vec![
		(GatewayError::Auth(AuthError::Missing), StatusCode::UNAUTHORIZED),
		(GatewayError::Auth(AuthError::Invalid), StatusCode::UNAUTHORIZED),
		(
			GatewayError::Auth(AuthError::ScopeDenied {
				endpoint: "Orders".to_string(),
				available: "Products,Cust*".to_string(),
			}),
			StatusCode::FORBIDDEN,
		),
		(
			GatewayError::RateLimited {
				retry_after_secs: 30,
			},
			StatusCode::TOO_MANY_REQUESTS,
		),
		(
			GatewayError::NotFound("nope".to_string()),
			StatusCode::NOT_FOUND,
		),
		(GatewayError::MethodNotAllowed, StatusCode::METHOD_NOT_ALLOWED),
		(
			GatewayError::Validation("bad".to_string()),
			StatusCode::BAD_REQUEST,
		),
		(
			GatewayError::EnvironmentUnknown {
				env: "nope".to_string(),
				known_endpoint: true,
			},
			StatusCode::BAD_REQUEST,
		),
		(
			GatewayError::EnvironmentUnknown {
				env: "nope".to_string(),
				known_endpoint: false,
			},
			StatusCode::NOT_FOUND,
		),
		(
			GatewayError::Sql(SqlError::MethodNotAllowed),
			StatusCode::METHOD_NOT_ALLOWED,
		),
		(
			GatewayError::Sql(SqlError::DisallowedColumns(vec!["Price".to_string()])),
			StatusCode::BAD_REQUEST,
		),
		(
			GatewayError::Proxy(ProxyError::Upstream("boom".to_string())),
			StatusCode::BAD_GATEWAY,
		),
		(
			GatewayError::Composite(CompositeError::StepFailed {
				index: 0,
				name: "CreateLines".to_string(),
				status: Some(500),
				body: "x".to_string(),
			}),
			StatusCode::BAD_GATEWAY,
		),
		(
			GatewayError::Webhook(WebhookError::UnknownWebhookId("x".to_string())),
			StatusCode::BAD_REQUEST,
		),
		(
			GatewayError::Internal("secret detail".to_string()),
			StatusCode::INTERNAL_SERVER_ERROR,
		),
	];
	for (error, expected) in cases {
		let (status, body, _) = error.parts();
		assert_eq!(status, expected, "wrong status for {body}");
	}
}

#[test]
fn scope_denial_body_lists_available_scopes() {
	let err = GatewayError::Auth(AuthError::ScopeDenied {
		endpoint: "Orders".to_string(),
		available: "Products,Cust*".to_string(),
	});
	let (_, body, _) = err.parts();
	assert_eq!(body["availableScopes"], "Products,Cust*");
	assert_eq!(body["requestedEndpoint"], "Orders");
}

#[test]
fn rate_limited_carries_retry_after() {
	let err = GatewayError::RateLimited {
		retry_after_secs: 42,
	};
	let (_, _, retry) = err.parts();
	assert_eq!(retry, Some(42));
}

#[test]
fn internal_errors_do_not_leak_detail() {
	let err = GatewayError::Internal("connection string Server=x;Password=y".to_string());
	let (_, body, _) = err.parts();
	assert_eq!(body["error"], "Internal server error");
}

#[test]
fn composite_step_failure_body_has_context() {
	let err = GatewayError::Composite(CompositeError::StepFailed {
		index: 1,
		name: "CreateHeader".to_string(),
		status: Some(422),
		body: "bad header".to_string(),
	});
	let (status, body, _) = err.parts();
	assert_eq!(status, StatusCode::BAD_GATEWAY);
	assert_eq!(body["step"], 1);
	assert_eq!(body["stepName"], "CreateHeader");
	assert_eq!(body["upstreamStatus"], 422);
	assert_eq!(body["upstreamBody"], "bad header");
}

#[test]
fn origin_prefers_forwarded_proto_and_host() {
	let req = ::http::Request::builder()
		.uri("/api/prod/Accounts")
		.header("host", "gw.example.com")
		.header("x-forwarded-proto", "https")
		.body(Body::empty())
		.unwrap();
	assert_eq!(request_origin(&req), "https://gw.example.com");

	let req = ::http::Request::builder()
		.uri("/api/prod/Accounts")
		.header("host", "gw:8080")
		.body(Body::empty())
		.unwrap();
	assert_eq!(request_origin(&req), "http://gw:8080");
}

#[test]
fn query_map_decodes_odata_keys() {
	let req = ::http::Request::builder()
		.uri("/api/prod/Products?$select=ItemCode&$filter=Description%20eq%20%27x%27&$top=2")
		.body(Body::empty())
		.unwrap();
	let map = query_map(&req);
	assert_eq!(map.get("$select").unwrap(), "ItemCode");
	assert_eq!(map.get("$filter").unwrap(), "Description eq 'x'");
	assert_eq!(map.get("$top").unwrap(), "2");
}
