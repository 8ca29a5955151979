use minijinja::Environment;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
#[error("Templating error: {0}")]
pub struct TemplateError(#[from] minijinja::Error);

fn environment() -> Result<Environment<'static>, TemplateError> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
    Ok(env)
}

/// Renders `template_str` with `${ name }` variables taken from `vars`.
/// Undefined variables are errors.
pub fn render_template(template_str: &str, vars: impl Serialize) -> Result<String, TemplateError> {
    let env = environment()?;
    let template = env.template_from_str(template_str)?;
    Ok(template.render(vars)?)
}
