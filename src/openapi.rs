//! OpenAPI 3 documents as tools: one remote tool per operation.
//!
//! Each operation's path, query and header parameters become top-level
//! properties of the tool's argument object; a JSON request body goes
//! under `body`. Local `$ref`s are resolved against the document.

use crate::error::ToolError;
use crate::tools::{sanitize_tool_name, RemoteTool, ToolContext, ToolSpec};
use async_trait::async_trait;
use openapiv3::{OpenAPI, Operation, Parameter, ParameterSchemaOrContent, ReferenceOr};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum OpenApiError {
    #[error("invalid OpenAPI document: {0}")]
    Parse(String),
    #[error("unresolvable reference '{0}'")]
    Reference(String),
    #[error("document declares no server; set one with with_base_url")]
    NoServer,
    #[error("invalid base URL '{0}'")]
    BaseUrl(String),
}

/// How requests authenticate. Credentials are read from session state at
/// call time, so they never live in the tool definition.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthScheme {
    None,
    /// `Authorization: Bearer <state[state_key]>`.
    Bearer { state_key: String },
    /// `<header>: <state[state_key]>`.
    ApiKeyHeader { header: String, state_key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone)]
struct ParamBinding {
    name: String,
    location: Location,
}

/// The operations of one document ready to become tools.
pub struct OpenApiToolset {
    doc: OpenAPI,
    raw: Value,
    base_url: Option<String>,
    auth: AuthScheme,
    client: reqwest::Client,
}

impl OpenApiToolset {
    pub fn from_yaml(text: &str) -> Result<Self, OpenApiError> {
        let doc: OpenAPI =
            serde_yaml::from_str(text).map_err(|e| OpenApiError::Parse(e.to_string()))?;
        Self::from_doc(doc)
    }

    pub fn from_json(text: &str) -> Result<Self, OpenApiError> {
        let doc: OpenAPI =
            serde_json::from_str(text).map_err(|e| OpenApiError::Parse(e.to_string()))?;
        Self::from_doc(doc)
    }

    fn from_doc(doc: OpenAPI) -> Result<Self, OpenApiError> {
        let raw = serde_json::to_value(&doc).map_err(|e| OpenApiError::Parse(e.to_string()))?;
        Ok(Self {
            doc,
            raw,
            base_url: None,
            auth: AuthScheme::None,
            client: reqwest::Client::new(),
        })
    }

    /// Overrides the document's first server.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// One tool per operation that has an `operationId`.
    pub fn tools(&self) -> Result<Vec<ToolSpec>, OpenApiError> {
        let base = self
            .base_url
            .clone()
            .or_else(|| self.doc.servers.first().map(|s| s.url.clone()))
            .ok_or(OpenApiError::NoServer)?;
        let base = Url::parse(&base).map_err(|_| OpenApiError::BaseUrl(base.clone()))?;

        let mut tools = Vec::new();
        for (path, item) in self.doc.paths.iter() {
            let item = self.resolve(item)?;
            for (method, operation) in item.iter() {
                let Some(operation_id) = &operation.operation_id else {
                    debug!(%path, %method, "operation without operationId skipped");
                    continue;
                };
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|e| OpenApiError::Parse(e.to_string()))?;

                let mut parameters = item.parameters.clone();
                parameters.extend(operation.parameters.iter().cloned());
                let (schema, bindings, has_body) = self.operation_schema(operation, &parameters)?;

                let name = sanitize_tool_name(operation_id);
                let description = operation
                    .summary
                    .clone()
                    .or_else(|| operation.description.clone())
                    .unwrap_or_else(|| format!("{} {}", method, path));
                let call = OpenApiCall {
                    service: format!("openapi:{}", self.doc.info.title),
                    client: self.client.clone(),
                    base: base.clone(),
                    method,
                    path: path.clone(),
                    bindings,
                    has_body,
                    auth: self.auth.clone(),
                };
                tools.push(ToolSpec::remote(name, description, schema, Arc::new(call)));
            }
        }
        Ok(tools)
    }

    fn operation_schema(
        &self,
        operation: &Operation,
        parameters: &[ReferenceOr<Parameter>],
    ) -> Result<(Value, Vec<ParamBinding>, bool), OpenApiError> {
        let mut properties = Map::new();
        let mut required = Vec::new();
        let mut bindings = Vec::new();

        for parameter in parameters {
            let parameter = self.resolve(parameter)?;
            let location = match &parameter {
                Parameter::Path { .. } => Location::Path,
                Parameter::Query { .. } => Location::Query,
                Parameter::Header { .. } => Location::Header,
                Parameter::Cookie { .. } => continue,
            };
            let data = parameter.parameter_data_ref();
            let mut schema = match &data.format {
                ParameterSchemaOrContent::Schema(schema) => self.schema_value(schema)?,
                ParameterSchemaOrContent::Content(_) => json!({"type": "string"}),
            };
            if let (Some(description), Some(obj)) = (&data.description, schema.as_object_mut()) {
                obj.insert("description".into(), json!(description));
            }
            properties.insert(data.name.clone(), schema);
            if data.required || location == Location::Path {
                required.push(json!(data.name));
            }
            bindings.push(ParamBinding {
                name: data.name.clone(),
                location,
            });
        }

        let mut has_body = false;
        if let Some(body) = &operation.request_body {
            let body = self.resolve(body)?;
            if let Some(media) = body.content.get("application/json") {
                let schema = match &media.schema {
                    Some(schema) => self.schema_value(schema)?,
                    None => json!({"type": "object"}),
                };
                properties.insert("body".into(), schema);
                if body.required {
                    required.push(json!("body"));
                }
                has_body = true;
            }
        }

        let mut schema = json!({"type": "object", "properties": properties});
        if !required.is_empty() {
            schema["required"] = Value::Array(required);
        }
        Ok((schema, bindings, has_body))
    }

    /// A schema as plain JSON with a top-level `$ref` inlined.
    fn schema_value(
        &self,
        schema: &ReferenceOr<openapiv3::Schema>,
    ) -> Result<Value, OpenApiError> {
        match schema {
            ReferenceOr::Item(schema) => {
                serde_json::to_value(schema).map_err(|e| OpenApiError::Parse(e.to_string()))
            }
            ReferenceOr::Reference { reference } => self.lookup(reference).cloned(),
        }
    }

    fn resolve<T: DeserializeOwned + Clone>(
        &self,
        item: &ReferenceOr<T>,
    ) -> Result<T, OpenApiError> {
        match item {
            ReferenceOr::Item(item) => Ok(item.clone()),
            ReferenceOr::Reference { reference } => serde_json::from_value(
                self.lookup(reference)?.clone(),
            )
            .map_err(|_| OpenApiError::Reference(reference.clone())),
        }
    }

    fn lookup(&self, reference: &str) -> Result<&Value, OpenApiError> {
        reference
            .strip_prefix('#')
            .and_then(|pointer| self.raw.pointer(pointer))
            .ok_or_else(|| OpenApiError::Reference(reference.to_string()))
    }
}

/// One operation bound to a base URL.
struct OpenApiCall {
    service: String,
    client: reqwest::Client,
    base: Url,
    method: Method,
    path: String,
    bindings: Vec<ParamBinding>,
    has_body: bool,
    auth: AuthScheme,
}

impl OpenApiCall {
    fn url(&self, args: &Value) -> Result<Url, ToolError> {
        let mut url = self.base.clone();
        let segments: Vec<String> = self
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|segment| self.fill_segment(segment, args))
            .collect::<Result<_, _>>()?;
        url.path_segments_mut()
            .map_err(|_| ToolError::Failed(format!("base URL '{}' cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn fill_segment(&self, segment: &str, args: &Value) -> Result<String, ToolError> {
        let mut out = segment.to_string();
        for binding in self.bindings.iter().filter(|b| b.location == Location::Path) {
            let placeholder = format!("{{{}}}", binding.name);
            if out.contains(&placeholder) {
                let value = args
                    .get(&binding.name)
                    .map(scalar)
                    .ok_or_else(|| {
                        ToolError::InvalidArgs(format!(
                            "missing path parameter '{}'",
                            binding.name
                        ))
                    })?;
                out = out.replace(&placeholder, &value);
            }
        }
        Ok(out)
    }

    fn credential(&self, ctx: &ToolContext, state_key: &str) -> Result<String, ToolError> {
        match ctx.state.get(state_key) {
            Some(Value::String(token)) if !token.is_empty() => Ok(token),
            _ => {
                ctx.request_auth(state_key);
                Err(ToolError::AuthRequired(state_key.to_string()))
            }
        }
    }
}

#[async_trait]
impl RemoteTool for OpenApiCall {
    fn service(&self) -> &str {
        &self.service
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let mut request = self.client.request(self.method.clone(), self.url(&args)?);
        for binding in &self.bindings {
            let Some(value) = args.get(&binding.name) else {
                continue;
            };
            match binding.location {
                Location::Query => request = request.query(&[(&binding.name, scalar(value))]),
                Location::Header => request = request.header(binding.name.as_str(), scalar(value)),
                Location::Path => {}
            }
        }
        if self.has_body {
            if let Some(body) = args.get("body") {
                request = request.json(body);
            }
        }
        match &self.auth {
            AuthScheme::None => {}
            AuthScheme::Bearer { state_key } => {
                request = request.bearer_auth(self.credential(ctx, state_key)?);
            }
            AuthScheme::ApiKeyHeader { header, state_key } => {
                request = request.header(header.as_str(), self.credential(ctx, state_key)?);
            }
        }

        debug!(
            service = %self.service,
            method = %self.method,
            path = %self.path,
            "calling operation"
        );
        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("reading response failed: {}", e)))?;
        if !status.is_success() {
            return Err(ToolError::Failed(format!("HTTP {}: {}", status, text)));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Parameter values go on the wire without JSON quoting.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SharedState, State};
    use crate::tools::ToolTarget;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PETSTORE: &str = r##"
openapi: 3.0.3
info:
  title: petstore
  version: "1.0"
servers:
  - url: https://pets.example.com/v1
paths:
  /pets:
    get:
      operationId: listPets
      summary: List pets
      parameters:
        - name: limit
          in: query
          schema:
            type: integer
    post:
      operationId: createPet
      requestBody:
        required: true
        content:
          application/json:
            schema:
              $ref: "#/components/schemas/Pet"
  /pets/{petId}:
    parameters:
      - $ref: "#/components/parameters/PetId"
    get:
      operationId: show.pet
      description: Info for a specific pet
    delete:
      summary: no operation id
components:
  parameters:
    PetId:
      name: petId
      in: path
      required: true
      schema:
        type: string
  schemas:
    Pet:
      type: object
      required: [name]
      properties:
        name:
          type: string
"##;

    fn ctx(state: &SharedState) -> ToolContext {
        ToolContext::new("pets", "inv-1", "call-1", State::new(state.clone()))
    }

    fn remote(tool: &ToolSpec) -> &Arc<dyn RemoteTool> {
        match &tool.target {
            ToolTarget::Remote(remote) => remote,
            other => panic!("expected remote tool, got {:?}", other),
        }
    }

    #[test]
    fn test_one_tool_per_operation() {
        let tools = OpenApiToolset::from_yaml(PETSTORE).unwrap().tools().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["listPets", "createPet", "show_pet"]);

        assert_eq!(tools[0].description, "List pets");
        assert_eq!(tools[0].parameters["properties"]["limit"]["type"], "integer");
        assert!(tools[0].parameters.get("required").is_none());

        assert_eq!(tools[1].parameters["required"], json!(["body"]));
        assert_eq!(tools[1].parameters["properties"]["body"]["required"], json!(["name"]));

        assert_eq!(tools[2].description, "Info for a specific pet");
        assert_eq!(tools[2].parameters["required"], json!(["petId"]));
    }

    #[tokio::test]
    async fn test_call_fills_path_query_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/pets/rex%20jr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "rex jr"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/pets"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("two pets"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/pets"))
            .and(body_json(json!({"name": "tom"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9})))
            .mount(&server)
            .await;

        let tools = OpenApiToolset::from_yaml(PETSTORE)
            .unwrap()
            .with_base_url(format!("{}/v1", server.uri()))
            .tools()
            .unwrap();
        let state = SharedState::default();

        let shown = remote(&tools[2])
            .call(json!({"petId": "rex jr"}), &ctx(&state))
            .await
            .unwrap();
        assert_eq!(shown, json!({"name": "rex jr"}));

        let listed = remote(&tools[0]).call(json!({"limit": 2}), &ctx(&state)).await.unwrap();
        assert_eq!(listed, json!("two pets"));

        let created = remote(&tools[1])
            .call(json!({"body": {"name": "tom"}}), &ctx(&state))
            .await
            .unwrap();
        assert_eq!(created, json!({"id": 9}));
    }

    #[tokio::test]
    async fn test_bearer_token_from_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let tools = OpenApiToolset::from_yaml(PETSTORE)
            .unwrap()
            .with_base_url(format!("{}/v1", server.uri()))
            .with_auth(AuthScheme::Bearer {
                state_key: "user:pets_token".into(),
            })
            .tools()
            .unwrap();

        let state = SharedState::default();
        let missing = ctx(&state);
        let err = remote(&tools[0]).call(json!({}), &missing).await.unwrap_err();
        assert!(matches!(err, ToolError::AuthRequired(ref key) if key == "user:pets_token"));
        assert_eq!(
            missing.take_actions().requested_auth.as_deref(),
            Some("user:pets_token")
        );

        state.set("user:pets_token", "s3cret");
        let listed = remote(&tools[0]).call(json!({}), &ctx(&state)).await.unwrap();
        assert_eq!(listed, json!([]));
    }

    #[test]
    fn test_missing_server() {
        let doc = r#"{"openapi": "3.0.0", "info": {"title": "t", "version": "1"}, "paths": {}}"#;
        assert!(matches!(
            OpenApiToolset::from_json(doc).unwrap().tools(),
            Err(OpenApiError::NoServer)
        ));
    }
}
