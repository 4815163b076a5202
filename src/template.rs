//! Template-mode preprocessing for hook definition files (spec §4.6 step 2,
//! §6): when enabled, a hook file is rendered as a Handlebars template before
//! being parsed as JSON/YAML, with a `getenv` helper exposing the process
//! environment — the same shape as Go's `text/template` + function-map idiom
//! the original tool uses, expressed with the templating crate the rest of
//! this pack reaches for (`handlebars`).

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};

/// Render `source` as a Handlebars template with no input data (hook files
/// reference only environment variables, via `{{getenv "NAME"}}`).
pub fn render(source: &str) -> Result<String, String> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_helper("getenv", Box::new(getenv_helper));
    hb.render_template(source, &())
        .map_err(|e| e.to_string())
}

fn getenv_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let name = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .unwrap_or_default();
    let value = std::env::var(name).unwrap_or_default();
    out.write(&value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getenv_substitutes_environment_variable() {
        std::env::set_var("HOOKFORGE_TEST_TEMPLATE_VAR", "injected");
        let rendered = render(r#"{"value": "{{getenv "HOOKFORGE_TEST_TEMPLATE_VAR"}}"}"#).unwrap();
        assert_eq!(rendered, r#"{"value": "injected"}"#);
    }

    #[test]
    fn missing_variable_renders_empty() {
        std::env::remove_var("HOOKFORGE_DOES_NOT_EXIST");
        let rendered = render(r#"{{getenv "HOOKFORGE_DOES_NOT_EXIST"}}"#).unwrap();
        assert_eq!(rendered, "");
    }
}
