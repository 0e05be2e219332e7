use std::fmt;

use serde_json::Value;

use crate::config::RouterRules;
use crate::providers::{Provider, Registry};
use crate::proxy::error::RelayError;

/// The closed set of route classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Default,
    Think,
    Background,
    LongContext,
    WebSearch,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Default => "default",
            RouteClass::Think => "think",
            RouteClass::Background => "background",
            RouteClass::LongContext => "long-context",
            RouteClass::WebSearch => "web-search",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The router's output: which adapter to call with which concrete model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    pub route: RouteClass,
}

/// Picks `(provider, model, route class)` for each inbound request.
#[derive(Debug, Clone)]
pub struct Router {
    rules: RouterRules,
}

impl Router {
    pub fn new(rules: RouterRules) -> Self {
        Self { rules }
    }

    /// Selection procedure, first match wins:
    /// comma tag > explicit provider/model > thinking object > web-search
    /// tools > long-context estimate > haiku background > default.
    pub fn select(&self, registry: &Registry, body: &Value) -> Result<Selection, RelayError> {
        let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
        self.select_model(registry, model, body)
    }

    fn select_model(
        &self,
        registry: &Registry,
        model: &str,
        body: &Value,
    ) -> Result<Selection, RelayError> {
        // 逗号后缀是路由标签；未知标签剥掉后对剩余部分重新选路
        if let Some((rest, tag)) = model.rsplit_once(',') {
            return match tag.trim() {
                "think" => self.resolve_class(registry, RouteClass::Think),
                "background" => self.resolve_class(registry, RouteClass::Background),
                "web-search" => self.resolve_class(registry, RouteClass::WebSearch),
                _ => self.select_model(registry, rest, body),
            };
        }

        if model.contains('/') {
            if let Some(selection) = self.explicit(registry, model)? {
                return Ok(selection);
            }
        }

        if body.get("thinking").map(|t| !t.is_null()).unwrap_or(false) {
            return self.resolve_class(registry, RouteClass::Think);
        }

        if has_web_search_tool(body) {
            return self.resolve_class(registry, RouteClass::WebSearch);
        }

        if estimate_input_tokens(body) > self.rules.long_context_threshold {
            return self.resolve_class(registry, RouteClass::LongContext);
        }

        if model.starts_with("claude-3-5-haiku") {
            return self.resolve_class(registry, RouteClass::Background);
        }

        self.resolve_class(registry, RouteClass::Default)
    }

    /// Rule 1: `<provider>/<model>` names a registered provider directly.
    /// An unknown provider prefix falls through to the remaining rules; a
    /// known provider with a whitelisted-out model is an error.
    fn explicit(
        &self,
        registry: &Registry,
        model: &str,
    ) -> Result<Option<Selection>, RelayError> {
        let Some((provider, rest)) = model.split_once('/') else {
            return Ok(None);
        };
        let Some(adapter) = registry.get(provider) else {
            return Ok(None);
        };
        check_whitelist(registry, adapter.name(), rest)?;
        Ok(Some(Selection {
            provider: provider.to_string(),
            model: rest.to_string(),
            route: RouteClass::Default,
        }))
    }

    /// Read `(provider, model)` for a route class from configuration,
    /// falling back to `default` when the class is not configured.
    fn resolve_class(
        &self,
        registry: &Registry,
        route: RouteClass,
    ) -> Result<Selection, RelayError> {
        let rule = match route {
            RouteClass::Default => self.rules.default.as_deref(),
            RouteClass::Think => self.rules.think.as_deref(),
            RouteClass::Background => self.rules.background.as_deref(),
            RouteClass::LongContext => self.rules.long_context.as_deref(),
            RouteClass::WebSearch => self.rules.web_search.as_deref(),
        };
        let rule = match rule.or(self.rules.default.as_deref()) {
            Some(r) => r,
            None => {
                return Err(RelayError::Config(
                    "router has no default route configured".to_string(),
                ))
            }
        };

        let Some((provider, model)) = rule.split_once('/') else {
            return Err(RelayError::Routing(format!(
                "route '{rule}' is not of the form '<provider>/<model>'"
            )));
        };
        if registry.get(provider).is_none() {
            return Err(RelayError::Routing(format!(
                "route class '{route}' references unknown provider '{provider}'"
            )));
        }
        check_whitelist(registry, provider, model)?;

        Ok(Selection {
            provider: provider.to_string(),
            model: model.to_string(),
            route,
        })
    }

    pub fn rules(&self) -> &RouterRules {
        &self.rules
    }
}

fn check_whitelist(
    registry: &Registry,
    provider: &str,
    model: &str,
) -> Result<(), RelayError> {
    if let Some(adapter) = registry.get(provider) {
        if !adapter.allows_model(model) {
            return Err(RelayError::ModelNotAllowed {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }
    }
    Ok(())
}

/// Web-search routing: any tool whose type or name starts with `web_search`.
fn has_web_search_tool(body: &Value) -> bool {
    body.get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools.iter().any(|tool| {
                let type_match = tool
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t.starts_with("web_search"))
                    .unwrap_or(false);
                let name_match = tool
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| n.starts_with("web_search"))
                    .unwrap_or(false);
                type_match || name_match
            })
        })
        .unwrap_or(false)
}

/// Cheap input-size heuristic: four characters per token over the request's
/// text content and system prompt. A soft trigger, not a tokenizer.
pub fn estimate_input_tokens(body: &Value) -> usize {
    let mut chars = 0usize;

    match body.get("system") {
        Some(Value::String(s)) => chars += s.len(),
        Some(Value::Array(parts)) => {
            for p in parts {
                if let Some(text) = p.get("text").and_then(|t| t.as_str()) {
                    chars += text.len();
                }
            }
        }
        _ => {}
    }

    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        for msg in messages {
            match msg.get("content") {
                Some(Value::String(s)) => chars += s.len(),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            chars += text.len();
                        } else if let Some(content) = block.get("content") {
                            // tool_result 的嵌套内容也计入
                            match content {
                                Value::String(s) => chars += s.len(),
                                Value::Array(parts) => {
                                    for p in parts {
                                        if let Some(text) =
                                            p.get("text").and_then(|t| t.as_str())
                                        {
                                            chars += text.len();
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    chars / 4
}
