use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tutorhost_domain::{LaunchInfo, LocalIndex, RuntimeError, RuntimeLaunchConfig};

use crate::config::{DataPaths, SidecarConfig};
use crate::provision::env_python;

/// Index entry holding a bundled interpreter.
pub(crate) const RUNTIME_BUNDLE: (&str, &str) = ("runtime", "python");

/// Everything needed to spawn the sidecar.
#[derive(Debug, Clone)]
pub(crate) struct LaunchPlan {
    pub(crate) info: LaunchInfo,
    pub(crate) envs: Vec<(String, String)>,
}

pub(crate) struct LaunchInputs<'a> {
    pub(crate) settings: &'a SidecarConfig,
    pub(crate) paths: &'a DataPaths,
    pub(crate) index: &'a LocalIndex,
    pub(crate) code_bundle: (&'a str, &'a str),
    pub(crate) config: &'a RuntimeLaunchConfig,
}

pub(crate) fn plan_launch(inputs: &LaunchInputs<'_>) -> Result<LaunchPlan, RuntimeError> {
    let (executable, source) = resolve_executable(inputs)?;
    let working_dir = resolve_working_dir(inputs)?;
    let entrypoint = working_dir.join(&inputs.settings.entrypoint);
    let base_url = inputs.settings.base_url();
    let envs = child_env(inputs)?;
    Ok(LaunchPlan {
        info: LaunchInfo {
            executable,
            executable_source: source.to_string(),
            working_dir,
            entrypoint,
            base_url,
        },
        envs,
    })
}

fn resolve_executable(inputs: &LaunchInputs<'_>) -> Result<(PathBuf, &'static str), RuntimeError> {
    for (explicit, source) in [
        (inputs.config.python_path.as_ref(), "launch config"),
        (inputs.settings.python.as_ref(), "sidecar settings"),
    ] {
        if let Some(path) = explicit {
            if path.is_file() {
                return Ok((path.clone(), source));
            }
            return Err(RuntimeError::Validation(format!(
                "python from {source} does not exist: {}",
                path.display()
            )));
        }
    }

    let provisioned = env_python(&inputs.paths.runtime_env);
    if provisioned.is_file() {
        return Ok((provisioned, "provisioned environment"));
    }

    if let Some(entry) = inputs.index.installed(RUNTIME_BUNDLE.0, RUNTIME_BUNDLE.1) {
        if let Some(python) = locate_python_binary(&entry.path) {
            return Ok((python, "bundled runtime"));
        }
    }

    for name in ["python3", "python"] {
        if let Ok(path) = which::which(name) {
            return Ok((path, "system PATH"));
        }
    }
    Err(RuntimeError::Validation(
        "no python interpreter found; run provisioning or set TUTORHOST_SIDECAR_PYTHON".to_string(),
    ))
}

fn interpreter_names() -> &'static [&'static str] {
    if cfg!(windows) {
        &["python.exe", "python3.exe"]
    } else {
        &["python3", "python"]
    }
}

/// Look for an interpreter in the usual spots of an unpacked runtime.
fn locate_python_binary(root: &Path) -> Option<PathBuf> {
    let dirs = [
        root.to_path_buf(),
        root.join("bin"),
        root.join("python"),
        root.join("python").join("bin"),
        root.join("install").join("bin"),
    ];
    dirs.iter()
        .flat_map(|dir| interpreter_names().iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

fn resolve_working_dir(inputs: &LaunchInputs<'_>) -> Result<PathBuf, RuntimeError> {
    let mut candidates = Vec::new();
    if let Some(dir) = &inputs.settings.working_dir {
        candidates.push(dir.clone());
    }
    let (bundle_type, scope_id) = inputs.code_bundle;
    if let Some(entry) = inputs.index.installed(bundle_type, scope_id) {
        candidates.push(entry.path.clone());
        candidates.push(entry.path.join("sidecar"));
    }
    candidates
        .into_iter()
        .find(|dir| dir.join(&inputs.settings.entrypoint).is_file())
        .ok_or_else(|| {
            RuntimeError::Validation(format!(
                "no sidecar directory containing {} (is the {bundle_type}/{scope_id} bundle installed?)",
                inputs.settings.entrypoint
            ))
        })
}

fn env_key(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn child_env(inputs: &LaunchInputs<'_>) -> Result<Vec<(String, String)>, RuntimeError> {
    let paths = inputs.paths;
    fs::create_dir_all(&paths.sessions)
        .map_err(|err| RuntimeError::io(format!("creating {}", paths.sessions.display()), &err))?;

    let mut envs = Vec::new();
    let mut bundle_dirs = Vec::new();
    for (bundle_type, scope_id, entry) in inputs.index.iter() {
        if !entry.path.is_dir() {
            continue;
        }
        envs.push((
            format!("TUTORHOST_BUNDLE_{}_{}", env_key(bundle_type), env_key(scope_id)),
            entry.path.display().to_string(),
        ));
        bundle_dirs.push(entry.path.clone());
    }
    if let Ok(joined) = env::join_paths(&bundle_dirs) {
        envs.push((
            "TUTORHOST_BUNDLE_DIRS".to_string(),
            joined.to_string_lossy().into_owned(),
        ));
    }
    envs.push((
        "TUTORHOST_BUNDLES_ROOT".to_string(),
        paths.bundles.display().to_string(),
    ));
    envs.push((
        "TUTORHOST_SESSION_DIR".to_string(),
        paths.sessions.display().to_string(),
    ));

    let config = inputs.config;
    envs.push(("LLM_PROVIDER".to_string(), config.llm_provider.clone()));
    envs.push(("LLM_API_KEY".to_string(), config.llm_api_key.clone()));
    if let Some(model) = &config.llm_model {
        envs.push(("LLM_MODEL".to_string(), model.clone()));
    }
    if let Some(base_url) = &config.llm_base_url {
        envs.push(("LLM_BASE_URL".to_string(), base_url.clone()));
    }

    envs.push(("SIDECAR_HOST".to_string(), inputs.settings.host.clone()));
    envs.push(("SIDECAR_PORT".to_string(), inputs.settings.port.to_string()));
    envs.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
    envs.push(("PYTHONNOUSERSITE".to_string(), "1".to_string()));
    Ok(envs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorhost_domain::InstalledBundleEntry;

    struct Layout {
        _temp: tempfile::TempDir,
        paths: DataPaths,
        index: LocalIndex,
        code_dir: PathBuf,
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    fn installed(path: &Path) -> InstalledBundleEntry {
        InstalledBundleEntry {
            version: "1".into(),
            path: path.to_path_buf(),
            sha256: "00".repeat(32),
            installed_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    fn layout() -> Layout {
        let temp = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(temp.path());
        let code_dir = paths.bundles.join("sidecar/default/1");
        touch(&code_dir.join("sidecar/main.py"));
        let mut index = LocalIndex::default();
        index.insert("sidecar", "default", installed(&code_dir));
        Layout {
            _temp: temp,
            paths,
            index,
            code_dir,
        }
    }

    fn inputs<'a>(
        layout: &'a Layout,
        settings: &'a SidecarConfig,
        config: &'a RuntimeLaunchConfig,
    ) -> LaunchInputs<'a> {
        LaunchInputs {
            settings,
            paths: &layout.paths,
            index: &layout.index,
            code_bundle: ("sidecar", "default"),
            config,
        }
    }

    #[test]
    fn explicit_python_wins_over_everything() {
        let layout = layout();
        let explicit = layout.paths.root.join("custom/python");
        touch(&explicit);
        touch(&env_python(&layout.paths.runtime_env));
        let settings = SidecarConfig::default();
        let config = RuntimeLaunchConfig {
            python_path: Some(explicit.clone()),
            ..RuntimeLaunchConfig::default()
        };
        let plan = plan_launch(&inputs(&layout, &settings, &config)).unwrap();
        assert_eq!(plan.info.executable, explicit);
        assert_eq!(plan.info.executable_source, "launch config");
    }

    #[test]
    fn missing_explicit_python_is_an_error() {
        let layout = layout();
        let settings = SidecarConfig {
            python: Some(layout.paths.root.join("nope/python")),
            ..SidecarConfig::default()
        };
        let config = RuntimeLaunchConfig::default();
        let err = plan_launch(&inputs(&layout, &settings, &config)).unwrap_err();
        assert!(err.to_string().contains("sidecar settings"), "{err}");
    }

    #[test]
    fn provisioned_env_precedes_bundled_runtime() {
        let mut layout = layout();
        let runtime_dir = layout.paths.bundles.join("runtime/python/3.11");
        touch(&runtime_dir.join("bin").join(interpreter_names()[0]));
        layout
            .index
            .insert(RUNTIME_BUNDLE.0, RUNTIME_BUNDLE.1, installed(&runtime_dir));
        let settings = SidecarConfig::default();
        let config = RuntimeLaunchConfig::default();

        let plan = plan_launch(&inputs(&layout, &settings, &config)).unwrap();
        assert_eq!(plan.info.executable_source, "bundled runtime");

        touch(&env_python(&layout.paths.runtime_env));
        let plan = plan_launch(&inputs(&layout, &settings, &config)).unwrap();
        assert_eq!(plan.info.executable_source, "provisioned environment");
    }

    #[test]
    fn working_dir_is_first_candidate_with_entrypoint() {
        let layout = layout();
        touch(&env_python(&layout.paths.runtime_env));
        let settings = SidecarConfig {
            working_dir: Some(layout.paths.root.join("empty")),
            ..SidecarConfig::default()
        };
        let config = RuntimeLaunchConfig::default();
        let plan = plan_launch(&inputs(&layout, &settings, &config)).unwrap();
        assert_eq!(plan.info.working_dir, layout.code_dir.join("sidecar"));
        assert_eq!(
            plan.info.entrypoint,
            layout.code_dir.join("sidecar").join("main.py")
        );
    }

    #[test]
    fn environment_carries_bundles_session_and_credentials() {
        let layout = layout();
        touch(&env_python(&layout.paths.runtime_env));
        let settings = SidecarConfig::default();
        let config = RuntimeLaunchConfig {
            llm_provider: "openai".into(),
            llm_api_key: "sk-test".into(),
            llm_model: Some("gpt-4o-mini".into()),
            ..RuntimeLaunchConfig::default()
        };
        let plan = plan_launch(&inputs(&layout, &settings, &config)).unwrap();
        let get = |key: &str| {
            plan.envs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(
            get("TUTORHOST_BUNDLE_SIDECAR_DEFAULT"),
            Some(layout.code_dir.display().to_string())
        );
        assert_eq!(
            get("TUTORHOST_SESSION_DIR"),
            Some(layout.paths.sessions.display().to_string())
        );
        assert!(layout.paths.sessions.is_dir());
        assert_eq!(get("LLM_PROVIDER").as_deref(), Some("openai"));
        assert_eq!(get("LLM_API_KEY").as_deref(), Some("sk-test"));
        assert_eq!(get("LLM_MODEL").as_deref(), Some("gpt-4o-mini"));
        assert_eq!(get("LLM_BASE_URL"), None);
        assert_eq!(get("SIDECAR_PORT").as_deref(), Some("8765"));
        assert_eq!(get("PYTHONUNBUFFERED").as_deref(), Some("1"));
    }

    #[test]
    fn env_keys_are_sanitized() {
        assert_eq!(env_key("algebra-1.v2"), "ALGEBRA_1_V2");
    }
}
