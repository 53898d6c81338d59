// CLI commands for managing Sandrun
use anyhow::{anyhow, bail, Context, Result};
use sandrun_common::config::Config;
use sandrun_common::types::Language;
use sandrun_engine::docker::DockerEnvironment;
use sandrun_engine::registry::LanguagesJson;
use sandrun_engine::{DispatchSettings, Dispatcher, LanguageRecipe, LanguageRegistry};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn builtin_languages() -> LanguagesJson {
    LanguagesJson {
        languages: Language::ALL.iter().map(|&l| LanguageRecipe::builtin(l)).collect(),
    }
}

/// Load languages configuration; a missing file means the built-in recipes
pub fn load_languages_config(config_path: &Path) -> Result<LanguagesJson> {
    if !config_path.exists() {
        return Ok(builtin_languages());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", config_path.display()))
}

/// Validate and save languages configuration
pub fn save_languages_config(config_path: &Path, config: &LanguagesJson) -> Result<()> {
    LanguageRegistry::from_recipes(config.languages.clone()).context("Refusing to save an invalid configuration")?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json_content = serde_json::to_string_pretty(config).context("Failed to serialize languages.json")?;
    fs::write(config_path, json_content).with_context(|| format!("Failed to write {}", config_path.display()))?;

    Ok(())
}

/// Initialize a Sandrun project with the default language recipes
pub async fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing Sandrun project at: {}", path);

    let config_dir = Path::new(path).join("config");
    fs::create_dir_all(&config_dir).with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;
    println!("  ✅ Created: config");

    let languages_json_path = config_dir.join("languages.json");
    if languages_json_path.exists() {
        println!("  ⏭️  Kept existing: config/languages.json");
    } else {
        save_languages_config(&languages_json_path, &builtin_languages())?;
        println!("  ✅ Created: config/languages.json");
    }

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Start one long-lived container per environment listed in config/languages.json");
    println!("  2. Add capacity: sandrun-cli add-env --language java --env leetcodecompiler-java-2");
    println!("  3. Set REDIS_URL and start sandrun-api and sandrun-worker");

    Ok(())
}

/// List all configured languages
pub async fn list_languages(config_path: &Path) -> Result<()> {
    let languages_json = load_languages_config(config_path)?;

    println!("📋 Configured Languages:\n");
    println!("{:<10} {:<6} {:<10} {:<10} {}", "Name", "Ext", "Compiled", "Lease", "Environments");
    println!("{}", "─".repeat(80));

    for recipe in &languages_json.languages {
        println!(
            "{:<10} {:<6} {:<10} {:<10} {}",
            recipe.language.as_str(),
            recipe.file_extension,
            if recipe.compile.is_some() { "yes" } else { "no" },
            if recipe.requires_exclusive_lease() { "exclusive" } else { "shared" },
            recipe.environments.join(", ")
        );
    }

    println!("\n✅ Total: {} language(s)", languages_json.languages.len());

    Ok(())
}

/// Add an environment to a language's pool
pub async fn add_environment(config_path: &Path, language: &str, environment: &str) -> Result<()> {
    let language = Language::parse(language).ok_or_else(|| anyhow!("Unknown language '{}'", language))?;
    let environment = environment.trim();
    if environment.is_empty() {
        bail!("Environment id cannot be empty");
    }

    let mut languages_json = load_languages_config(config_path)?;
    let idx = match languages_json.languages.iter().position(|r| r.language == language) {
        Some(idx) => idx,
        None => {
            languages_json.languages.push(LanguageRecipe::builtin(language));
            languages_json.languages.len() - 1
        }
    };
    let recipe = &mut languages_json.languages[idx];

    if recipe.environments.iter().any(|e| e == environment) {
        bail!("Environment '{}' is already configured for {}", environment, language);
    }
    recipe.environments.push(environment.to_string());
    let pool_size = recipe.environments.len();

    save_languages_config(config_path, &languages_json)?;
    println!("✅ Added environment '{}' to {} ({} total)", environment, language, pool_size);

    Ok(())
}

/// Execute a source file once through the dispatcher and print the result
pub async fn run_file(config_path: &Path, language: &str, file: &Path, timeout_secs: Option<u64>) -> Result<()> {
    let code = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let config = Config::from_env().context("Invalid configuration")?;
    let registry = LanguageRegistry::load_or_builtin(config_path)?
        .with_environment_overrides(|name| std::env::var(name).ok());

    let mut settings = DispatchSettings::from_config(&config);
    if let Some(secs) = timeout_secs {
        settings.execution_timeout = Duration::from_secs(secs);
    }

    let docker = DockerEnvironment::connect().context("Failed to connect to Docker")?;
    let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(docker), settings);

    let result = dispatcher.execute(&code, language).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.succeeded() {
        bail!("Execution finished with status {}", result.status.as_str());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_lists_builtin_recipes() {
        let dir = tempfile::tempdir().unwrap();
        let languages = load_languages_config(&dir.path().join("languages.json")).unwrap();
        assert_eq!(languages.languages.len(), Language::ALL.len());
    }

    #[tokio::test]
    async fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        init_project(dir.path().to_str().unwrap()).await.unwrap();

        let path = dir.path().join("config/languages.json");
        let registry = LanguageRegistry::load(&path).unwrap();
        assert!(registry.get(Language::Java).unwrap().requires_exclusive_lease());
    }

    #[tokio::test]
    async fn test_add_environment_grows_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");

        add_environment(&path, "java", "leetcodecompiler-java-2").await.unwrap();
        let languages = load_languages_config(&path).unwrap();
        let java = languages.languages.iter().find(|r| r.language == Language::Java).unwrap();
        assert_eq!(java.environments, vec!["leetcodecompiler-java-1", "leetcodecompiler-java-2"]);

        assert!(add_environment(&path, "java", "leetcodecompiler-java-2").await.is_err());
        assert!(add_environment(&path, "cobol", "x").await.is_err());
        assert!(add_environment(&path, "python", "  ").await.is_err());
    }

    #[test]
    fn test_save_rejects_invalid_recipes() {
        let dir = tempfile::tempdir().unwrap();
        let mut languages = builtin_languages();
        languages.languages[0].environments.clear();
        assert!(save_languages_config(&dir.path().join("languages.json"), &languages).is_err());
    }
}
