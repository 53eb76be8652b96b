// CLI commands for running and configuring the grader locally
use anyhow::{bail, Context, Result};
use codeclass_common::types::{ExecutionLimits, Fixture, GradingResult, Language};
use codeclass_grader::languages::{builtin_configs, LanguagesJson, DEFAULT_CONFIG_PATH};
use codeclass_grader::sandbox::{build_sandbox, SandboxBackend, SandboxSettings};
use codeclass_grader::{Grader, LanguageConfigManager};
use std::fs;
use std::path::Path;

pub struct DryRunArgs<'a> {
    pub file: &'a Path,
    pub language: Option<&'a str>,
    pub fixtures: &'a Path,
    pub backend: SandboxBackend,
    pub languages_path: &'a Path,
    pub limits: ExecutionLimits,
    pub json: bool,
}

/// Load a fixtures file: a JSON array of `{"input": .., "output": ..}`.
pub fn load_fixtures(path: &Path) -> Result<Vec<Fixture>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixtures file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse fixtures file {}", path.display()))
}

/// Guess the language from the file extension when none is given.
fn detect_language(file: &Path, declared: Option<&str>) -> Result<Language> {
    if let Some(declared) = declared {
        return Language::from_str(declared)
            .with_context(|| format!("Unsupported language: {}", declared));
    }
    match file.extension().and_then(|e| e.to_str()) {
        Some("py") => Ok(Language::Python),
        Some("js") | Some("mjs") => Ok(Language::JavaScript),
        _ => bail!(
            "Cannot infer language of {}; pass --language",
            file.display()
        ),
    }
}

/// Grade a local file against a fixtures file. Returns whether it passed.
pub async fn dry_run(args: DryRunArgs<'_>) -> Result<bool> {
    let code = fs::read_to_string(args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let language = detect_language(args.file, args.language)?;
    let fixtures = load_fixtures(args.fixtures)?;

    let languages = LanguageConfigManager::load_or_builtin(args.languages_path)?;
    let sandbox = build_sandbox(args.backend, &languages, SandboxSettings::default())?;
    let grader = Grader::new(sandbox, languages, args.limits);

    let result = grader
        .dry_run(&code, language, &fixtures, &args.limits)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.passed())
}

fn print_result(result: &GradingResult) {
    for (idx, test) in result.results.iter().enumerate() {
        if test.passed {
            println!("  ✓ test {}", idx + 1);
        } else {
            println!(
                "  ✗ test {}: {}",
                idx + 1,
                test.failure_reason.as_deref().unwrap_or("failed")
            );
            if !test.user_output.is_empty() {
                println!("      expected: {:?}", test.expected);
                println!("      got:      {:?}", test.user_output);
            }
        }
    }

    let passed = result.results.iter().filter(|t| t.passed).count();
    println!();
    if let Some(reason) = &result.reason {
        println!("✗ FAILED: {}", reason);
    } else if result.passed() {
        println!("✓ PASSED ({}/{})", passed, result.results.len());
    } else {
        println!("✗ FAILED ({}/{})", passed, result.results.len());
    }
}

pub fn list_languages(config_path: &Path) -> Result<()> {
    let manager = LanguageConfigManager::load_or_builtin(config_path)?;

    println!("Enabled languages:");
    for language in manager.list_languages() {
        let config = manager.get_config(&language)?;
        println!(
            "  {:<12} {} {:<8} image={} memory={}MB cpu={}",
            language.to_string(),
            config.execution.command,
            config.version,
            config.image,
            config.memory_limit_mb,
            config.cpu_limit
        );
    }
    Ok(())
}

/// Write the default `config/languages.json` under `path`.
pub fn init_project(path: &Path, force: bool) -> Result<()> {
    let config_path = path.join(DEFAULT_CONFIG_PATH);
    if config_path.exists() && !force {
        println!("  • {} already exists (use --force to overwrite)", config_path.display());
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(&LanguagesJson {
        languages: builtin_configs(),
    })?;
    fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("  ✓ Created: {}", config_path.display());
    Ok(())
}
