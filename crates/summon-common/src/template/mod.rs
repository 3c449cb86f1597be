//! Template renderer for desired child objects
//!
//! Templates are bundled minijinja documents producing YAML. Each render sees
//! two variables:
//! - `instance`: the top object being reconciled, serialised as in the API
//! - `extra`: a per-call mapping supplied by the component
//!
//! Strings interpolated into YAML should go through `tojson` so quoting is
//! always correct.

pub mod filters;

use std::collections::BTreeMap;

use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// Per-call template parameters
pub type Extras = BTreeMap<String, serde_json::Value>;

/// A bundled template: identifier and source
pub type TemplateSource = (&'static str, &'static str);

/// Read-only view over a set of bundled templates
#[derive(Debug)]
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    /// Compile every template up front so a broken bundle fails at startup
    pub fn new(templates: &[TemplateSource]) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_filter("or_default", filters::or_default);
        env.add_filter("dns_label", filters::dns_label);

        for (id, source) in templates.iter().copied() {
            env.add_template(id, source)
                .map_err(|e| Error::template(id, e.to_string()))?;
        }
        Ok(Self { env })
    }

    /// Renderer with no templates, for tops that never render children
    pub fn empty() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env }
    }

    /// Whether `id` is bundled
    pub fn has(&self, id: &str) -> bool {
        self.env.get_template(id).is_ok()
    }

    /// Render `id` to text
    pub fn render_str<T: Serialize>(
        &self,
        id: &str,
        instance: &T,
        extra: Option<&Extras>,
    ) -> Result<String> {
        let tmpl = self
            .env
            .get_template(id)
            .map_err(|e| Error::template(id, e.to_string()))?;
        let empty = Extras::new();
        let ctx = context! {
            instance => Value::from_serialize(instance),
            extra => Value::from_serialize(extra.unwrap_or(&empty)),
        };
        tmpl.render(ctx).map_err(|e| Error::template(id, e.to_string()))
    }

    /// Render `id` and decode the YAML output into a typed object
    pub fn render<K: DeserializeOwned, T: Serialize>(
        &self,
        id: &str,
        instance: &T,
        extra: Option<&Extras>,
    ) -> Result<K> {
        let text = self.render_str(id, instance, extra)?;
        serde_yaml::from_str(&text).map_err(|e| Error::template(id, e.to_string()))
    }
}

/// Build an `Extras` map from `key => value` pairs
#[macro_export]
macro_rules! extras {
    () => { $crate::template::Extras::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut m = $crate::template::Extras::new();
        $( m.insert($key.to_string(), $crate::__serde_json::json!($value)); )+
        m
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    const SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: {{ (instance.metadata.name ~ "-" ~ extra.role) | tojson }}
  namespace: {{ instance.metadata.namespace | tojson }}
spec:
  ports:
  - name: http
    port: {{ extra.port }}
"#;

    fn instance() -> serde_json::Value {
        serde_json::json!({"metadata": {"name": "foo", "namespace": "summon-dev"}})
    }

    #[test]
    fn renders_typed_object() {
        let r = TemplateRenderer::new(&[("web/service.yml.j2", SERVICE)]).unwrap();
        let extra = crate::extras! { "role" => "web", "port" => 8000 };
        let svc: Service = r.render("web/service.yml.j2", &instance(), Some(&extra)).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("foo-web"));
        assert_eq!(svc.metadata.namespace.as_deref(), Some("summon-dev"));
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 8000);
    }

    #[test]
    fn rendering_is_deterministic() {
        let r = TemplateRenderer::new(&[("svc", SERVICE)]).unwrap();
        let extra = crate::extras! { "role" => "daphne", "port" => 9000 };
        let a = r.render_str("svc", &instance(), Some(&extra)).unwrap();
        let b = r.render_str("svc", &instance(), Some(&extra)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_template_names_the_id() {
        let r = TemplateRenderer::empty();
        let err = r.render_str("nope.yml.j2", &instance(), None).unwrap_err();
        assert!(err.to_string().contains("nope.yml.j2"));
        assert!(!r.has("nope.yml.j2"));
    }

    #[test]
    fn broken_template_fails_at_construction() {
        let err = TemplateRenderer::new(&[("bad", "{% if %}")]).unwrap_err();
        assert!(err.to_string().contains("template bad"));
    }
}
