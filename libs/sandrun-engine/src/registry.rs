// Language registry: language -> execution recipe.
// Loaded once at startup from config/languages.json; never mutated afterwards.

use anyhow::{bail, Context, Result};
use sandrun_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::DispatchError;

/// How to materialize, compile and run code for one language.
///
/// Templates may use `{dir}` (working directory), `{name}` (artifact stem) and
/// `{file}` (`{dir}/{name}.{ext}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageRecipe {
    pub language: Language,
    pub file_extension: String,
    #[serde(default)]
    pub compile: Option<String>,
    pub run: String,
    /// Interchangeable, pre-provisioned environments serving this language
    pub environments: Vec<String>,
    /// Fixed artifact stem required by the toolchain (Java's public class `Main`).
    /// Recipes with an entry point cannot use unique names; each execution gets its own
    /// directory and runs under an exclusive lease.
    #[serde(default)]
    pub entry_point: Option<String>,
    /// Extra files produced by the compile step, removed after every execution.
    /// Not needed for entry-point recipes, whose whole directory is removed.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl LanguageRecipe {
    /// Recipe used when the config file does not mention a language
    pub fn builtin(language: Language) -> Self {
        match language {
            Language::Python => Self {
                language,
                file_extension: "py".to_string(),
                compile: None,
                run: "python3 {file}".to_string(),
                environments: vec!["leetcodecompiler-python-1".to_string()],
                entry_point: None,
                artifacts: vec![],
            },
            Language::NodeJs => Self {
                language,
                file_extension: "js".to_string(),
                compile: None,
                run: "node {file}".to_string(),
                environments: vec!["leetcodecompiler-node-1".to_string()],
                entry_point: None,
                artifacts: vec![],
            },
            Language::Cpp => Self {
                language,
                file_extension: "cpp".to_string(),
                compile: Some("g++ -O2 -o {dir}/{name} {file}".to_string()),
                run: "{dir}/{name}".to_string(),
                environments: vec!["leetcodecompiler-cpp-1".to_string()],
                entry_point: None,
                artifacts: vec!["{dir}/{name}".to_string()],
            },
            Language::Java => Self {
                language,
                file_extension: "java".to_string(),
                compile: Some("javac -d {dir} {file}".to_string()),
                run: "java -cp {dir} {name}".to_string(),
                environments: vec!["leetcodecompiler-java-1".to_string()],
                entry_point: Some("Main".to_string()),
                artifacts: vec![],
            },
        }
    }

    pub fn requires_exclusive_lease(&self) -> bool {
        self.entry_point.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.run.trim().is_empty() {
            bail!("Recipe for {} has an empty run template", self.language);
        }
        if self.file_extension.trim().is_empty() {
            bail!("Recipe for {} has an empty file extension", self.language);
        }
        if self.environments.iter().all(|e| e.trim().is_empty()) {
            bail!("Recipe for {} lists no environments", self.language);
        }
        if let Some(entry) = &self.entry_point {
            if entry.is_empty() || entry.contains(['/', ' ']) {
                bail!("Recipe for {} has an invalid entry point {:?}", self.language, entry);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageRecipe>,
}

/// Registry of configured languages. Lookups are pure; no I/O after construction.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    recipes: BTreeMap<Language, LanguageRecipe>,
}

impl LanguageRegistry {
    /// Every language with its built-in recipe
    pub fn builtin() -> Self {
        let recipes = Language::ALL
            .iter()
            .map(|&lang| (lang, LanguageRecipe::builtin(lang)))
            .collect();
        Self { recipes }
    }

    /// Only the given recipes; languages not listed are unsupported
    pub fn from_recipes(recipes: Vec<LanguageRecipe>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for recipe in recipes {
            recipe.validate()?;
            let language = recipe.language;
            if map.insert(language, recipe).is_some() {
                bail!("Language '{}' is configured more than once", language);
            }
        }
        if map.is_empty() {
            bail!("No languages configured");
        }
        Ok(Self { recipes: map })
    }

    /// Load recipes from a languages.json file. Languages the file omits keep their
    /// built-in recipe.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let parsed: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let configured = Self::from_recipes(parsed.languages)?;
        let mut registry = Self::builtin();
        registry.recipes.extend(configured.recipes);
        Ok(registry)
    }

    /// Load from `config_path` if it exists, otherwise fall back to the built-in recipes
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            Ok(Self::builtin())
        }
    }

    /// Replace environment pools from `SANDRUN_ENV_<LANG>` variables (comma-separated ids)
    pub fn with_environment_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for recipe in self.recipes.values_mut() {
            let var = format!("SANDRUN_ENV_{}", recipe.language.as_str().to_uppercase());
            if let Some(raw) = lookup(&var) {
                let ids: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if !ids.is_empty() {
                    recipe.environments = ids;
                }
            }
        }
        self
    }

    /// Resolve a client-supplied language identifier
    pub fn resolve(&self, language: &str) -> Result<&LanguageRecipe, DispatchError> {
        Language::parse(language)
            .and_then(|lang| self.recipes.get(&lang))
            .ok_or_else(|| DispatchError::UnsupportedLanguage {
                language: language.to_string(),
                supported: self.supported_names().join(", "),
            })
    }

    pub fn get(&self, language: Language) -> Option<&LanguageRecipe> {
        self.recipes.get(&language)
    }

    pub fn recipes(&self) -> impl Iterator<Item = &LanguageRecipe> {
        self.recipes.values()
    }

    pub fn languages(&self) -> Vec<Language> {
        self.recipes.keys().copied().collect()
    }

    pub fn supported_names(&self) -> Vec<&'static str> {
        self.recipes.keys().map(|l| l.as_str()).collect()
    }
}
