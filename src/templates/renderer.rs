use super::TemplatesError;
use crate::release::Job;
use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext as HbContext};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Component, Path};
use tracing::debug;

/// Values available to a job's templates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderContext {
    pub deployment: String,
    pub job: JobContext,
    pub index: u32,
    pub properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobContext {
    pub name: String,
}

/// Resolve the properties a job declares against the deployment's properties.
///
/// Each declared (dotted) property takes the deployment value when present,
/// otherwise the job's default; properties with neither are left out.
pub fn render_context(job: &Job, deployment_name: &str, properties: &Value) -> RenderContext {
    let mut resolved = Value::Object(Map::new());
    for (name, definition) in &job.properties {
        let value = lookup(properties, name).or_else(|| definition.default.clone());
        if let Some(value) = value {
            insert(&mut resolved, name, value);
        }
    }

    RenderContext {
        deployment: deployment_name.to_string(),
        job: JobContext {
            name: job.name.clone(),
        },
        index: 0,
        properties: resolved,
    }
}

fn lookup(properties: &Value, dotted: &str) -> Option<Value> {
    let mut current = properties;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn insert(root: &mut Value, dotted: &str, value: Value) {
    let mut segments: Vec<&str> = dotted.split('.').collect();
    let Some(last) = segments.pop() else { return };

    let mut current = root;
    for segment in segments {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

pub trait JobRenderer: Send + Sync {
    /// Render every template of `job` into `dest_dir`, at its declared destination path.
    fn render(
        &self,
        job: &Job,
        context: &RenderContext,
        dest_dir: &Path,
    ) -> Result<(), TemplatesError>;
}

pub struct HandlebarsJobRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for HandlebarsJobRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlebarsJobRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("json", Box::new(json_helper));
        Self { handlebars }
    }
}

impl JobRenderer for HandlebarsJobRenderer {
    fn render(
        &self,
        job: &Job,
        context: &RenderContext,
        dest_dir: &Path,
    ) -> Result<(), TemplatesError> {
        for (source, destination) in &job.templates {
            for path in [source, destination] {
                if !is_relative_within(path) {
                    return Err(TemplatesError::Render {
                        job: job.name.clone(),
                        template: source.clone(),
                        message: format!("path '{path}' escapes the job directory"),
                    });
                }
            }

            let source_path = job.templates_dir().join(source);
            let template =
                std::fs::read_to_string(&source_path).map_err(|source| TemplatesError::Io {
                    path: source_path.clone(),
                    source,
                })?;

            let rendered = self
                .handlebars
                .render_template(&template, context)
                .map_err(|e| TemplatesError::Render {
                    job: job.name.clone(),
                    template: source.clone(),
                    message: e.to_string(),
                })?;

            let dest_path = dest_dir.join(destination);
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| TemplatesError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&dest_path, rendered).map_err(|source| TemplatesError::Io {
                path: dest_path.clone(),
                source,
            })?;
            debug!("Rendered {} -> {:?}", source, dest_path);
        }
        Ok(())
    }
}

/// True for a non-empty relative path made only of plain components.
fn is_relative_within(path: &str) -> bool {
    let mut components = Path::new(path).components().peekable();
    components.peek().is_some()
        && components.all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `{{json properties.some.value}}` writes the value as JSON.
fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _rc: &mut HbContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).map(|p| p.value().clone()).unwrap_or(Value::Null);
    out.write(&value.to_string())?;
    Ok(())
}
