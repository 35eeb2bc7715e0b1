//! Expansion of declarative steps into executable plans.
//!
//! Every templated field is rendered against the cell here, so the cell
//! runner only deals with concrete strings. Provisioning, toolkit builds and
//! installs become POSIX `sh` scripts; checkout, cache and artifact steps are
//! handled by the runner itself.

use std::path::Path;

use snafu::ResultExt;
use tessera_ci_core::MatrixCell;
use tessera_ci_core::StepAction;
use tessera_ci_core::StepConfig;
use tessera_ci_core::config::NoFilesPolicy;
use tessera_ci_core::config::PackageSource;
use tessera_ci_core::matrix::OsFamily;
use tessera_ci_core::verified::TemplateVars;
use tessera_ci_core::verified::render_template;

use crate::error::CiError;
use crate::error::RenderStepSnafu;
use crate::error::Result;

/// Directory inside the workspace where toolkit sources are cloned.
pub const TOOLKIT_SOURCE_DIR: &str = ".tessera-toolkit";

/// What the runner does for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPlan {
    /// Run a shell script.
    Shell {
        /// Script passed to `sh -e -c`.
        script: String,
        /// Directories added to the search path once the script succeeds.
        path_after: Vec<String>,
    },
    /// Copy the source tree into the workspace.
    Checkout {
        /// Top-level entries to leave out.
        exclude: Vec<String>,
    },
    /// Restore a cache entry now, save it after a successful job.
    Cache {
        /// Literal key.
        key: String,
        /// Prefix fallbacks, in priority order.
        restore_keys: Vec<String>,
        /// Workspace-relative paths to archive.
        paths: Vec<String>,
    },
    /// Collect files into a named artifact bundle.
    Artifact {
        /// Bundle name.
        name: String,
        /// Workspace-relative directory searched for files.
        path: String,
        /// Glob relative to `path`.
        pattern: String,
        /// What to do when nothing matches.
        policy: NoFilesPolicy,
    },
}

/// A step with all templates rendered.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// Step name.
    pub name: String,
    /// Rendered working directory, relative to the workspace.
    pub working_dir: Option<String>,
    /// Rendered step environment.
    pub env: Vec<(String, String)>,
    /// Absolute search path additions declared on the step.
    pub path: Vec<String>,
    /// What to run.
    pub plan: StepPlan,
}

/// Render a step for one cell.
///
/// `workspace` is the cell workspace root; relative search path entries are
/// resolved against it.
pub fn plan_step(step: &StepConfig, cell: &MatrixCell, workflow: &str, workspace: &Path) -> Result<PlannedStep> {
    let cell_id = cell.id();
    let vars = cell.template_vars(workflow, &cell_id);
    let r = Renderer { step, vars };

    let working_dir = step.working_dir.as_deref().map(|d| r.render(d)).transpose()?;
    let mut env: Vec<(String, String)> =
        step.env.iter().map(|(k, v)| Ok((k.clone(), r.render(v)?))).collect::<Result<_>>()?;
    env.sort();
    let path = r.render_all(&step.add_path)?.iter().map(|p| absolute_in(workspace, p)).collect();

    let plan = match &step.action {
        StepAction::Checkout { exclude } => StepPlan::Checkout {
            exclude: r.render_all(exclude)?,
        },
        StepAction::Provision { apt, brew, runtime } => {
            let apt = r.render_all(apt)?;
            let brew = r.render_all(brew)?;
            let runtime = match runtime {
                Some(rt) => Some((r.render(&rt.name)?, r.render(&rt.version)?)),
                None => None,
            };
            StepPlan::Shell {
                script: provision_script(step, cell, &apt, &brew, runtime.as_ref())?,
                path_after: Vec::new(),
            }
        }
        StepAction::ToolkitBuild {
            repository,
            branch,
            subdir,
            configure_args,
            linker_flags,
            prefix,
            smoke_check,
            jobs,
        } => {
            let build = ToolkitBuild {
                repository: r.render(repository)?,
                branch: r.render(branch)?,
                subdir: subdir.as_deref().map(|s| r.render(s)).transpose()?,
                configure_args: r.render_all(configure_args)?,
                linker_flags: r.render_all(linker_flags)?,
                prefix: r.render(prefix)?,
                smoke_check: smoke_check.as_deref().map(|s| r.render(s)).transpose()?,
                jobs: *jobs,
            };
            StepPlan::Shell {
                script: build.script(&slug(&step.name)),
                path_after: vec![absolute_in(workspace, &format!("{}/bin", build.prefix))],
            }
        }
        StepAction::Install {
            installer,
            packages,
            source,
        } => {
            let installer = r.render(installer)?;
            let packages = r.render_all(packages)?;
            let source = match source {
                Some(PackageSource::Editable(p)) => Some(PackageSource::Editable(r.render(p)?)),
                Some(PackageSource::Index(n)) => Some(PackageSource::Index(r.render(n)?)),
                None => None,
            };
            StepPlan::Shell {
                script: install_script(&installer, &packages, source.as_ref()),
                path_after: Vec::new(),
            }
        }
        StepAction::Cache {
            key,
            restore_keys,
            paths,
        } => StepPlan::Cache {
            key: r.render(key)?,
            restore_keys: r.render_all(restore_keys)?,
            paths: r.render_all(paths)?,
        },
        StepAction::Run { run, .. } => StepPlan::Shell {
            script: r.render(run)?,
            path_after: Vec::new(),
        },
        StepAction::UploadArtifact {
            artifact,
            path,
            pattern,
            if_no_files_found,
        } => StepPlan::Artifact {
            name: r.render(artifact)?,
            path: r.render(path)?,
            pattern: r.render(pattern)?,
            policy: *if_no_files_found,
        },
    };

    Ok(PlannedStep {
        name: step.name.clone(),
        working_dir,
        env,
        path,
        plan,
    })
}

struct Renderer<'a> {
    step: &'a StepConfig,
    vars: TemplateVars<'a>,
}

impl Renderer<'_> {
    fn render(&self, template: &str) -> Result<String> {
        render_template(template, &self.vars).context(RenderStepSnafu { step: &self.step.name })
    }

    fn render_all(&self, templates: &[String]) -> Result<Vec<String>> {
        templates.iter().map(|t| self.render(t)).collect()
    }
}

fn absolute_in(workspace: &Path, entry: &str) -> String {
    let path = Path::new(entry);
    if path.is_absolute() {
        entry.to_string()
    } else {
        workspace.join(path).display().to_string()
    }
}

fn provision_script(
    step: &StepConfig,
    cell: &MatrixCell,
    apt: &[String],
    brew: &[String],
    runtime: Option<&(String, String)>,
) -> Result<String> {
    let mut lines = Vec::new();
    match cell.os_family() {
        OsFamily::Linux => {
            if !apt.is_empty() {
                lines.push(
                    "SUDO=\"\"; if [ \"$(id -u)\" != \"0\" ] && command -v sudo >/dev/null 2>&1; then SUDO=\"sudo -n\"; fi"
                        .to_string(),
                );
                lines.push("$SUDO apt-get update -y".to_string());
                lines.push(format!(
                    "$SUDO env DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {}",
                    quote_all(apt)
                ));
            }
        }
        OsFamily::MacOs => {
            if !brew.is_empty() {
                lines.push("export HOMEBREW_NO_AUTO_UPDATE=1".to_string());
                lines.push(format!("brew install {}", quote_all(brew)));
            }
        }
        family @ (OsFamily::Windows | OsFamily::Unknown) => {
            if !apt.is_empty() || !brew.is_empty() {
                return Err(CiError::UnsupportedPlatform {
                    step: step.name.clone(),
                    os: cell.os.clone(),
                    reason: format!("no package manager known for OS family {family:?}"),
                });
            }
        }
    }

    if let Some((name, version)) = runtime {
        let binary = shell_quote(&format!("{name}{version}"));
        lines.push(format!(
            "command -v {binary} >/dev/null 2>&1 || {{ echo \"runtime {name} {version} not found\" >&2; exit 1; }}"
        ));
        lines.push(format!("{binary} --version"));
    }

    if lines.is_empty() {
        lines.push(format!("echo \"nothing to provision on {}\"", cell.os));
    }
    Ok(lines.join("\n"))
}

struct ToolkitBuild {
    repository: String,
    branch: String,
    subdir: Option<String>,
    configure_args: Vec<String>,
    linker_flags: Vec<String>,
    prefix: String,
    smoke_check: Option<String>,
    jobs: Option<u32>,
}

impl ToolkitBuild {
    fn script(&self, slug: &str) -> String {
        let src = format!("\"$TESSERA_WORKSPACE/{TOOLKIT_SOURCE_DIR}/{slug}\"");
        let prefix = format!("\"$TESSERA_WORKSPACE/{}\"", self.prefix.trim_end_matches('/'));
        let flags = self.linker_flags.join(" ");
        let jobs = match self.jobs {
            Some(n) => n.to_string(),
            None => "\"$(getconf _NPROCESSORS_ONLN 2>/dev/null || echo 2)\"".to_string(),
        };

        let mut lines = vec![
            format!("rm -rf {src}"),
            format!(
                "git clone --depth 1 --branch {} {} {src}",
                shell_quote(&self.branch),
                shell_quote(&self.repository)
            ),
        ];
        match &self.subdir {
            Some(dir) => lines.push(format!("cd {src}/{}", shell_quote(dir))),
            None => lines.push(format!("cd {src}")),
        }
        lines.push("if [ -f configure.ac ] && [ ! -x configure ]; then autoconf; fi".to_string());

        let mut configure = String::new();
        if !flags.is_empty() {
            let flags = shell_quote(&flags);
            configure.push_str(&format!(
                "CFLAGS=\"${{CFLAGS:+$CFLAGS }}\"{flags} LDFLAGS=\"${{LDFLAGS:+$LDFLAGS }}\"{flags} "
            ));
        }
        configure.push_str(&format!("./configure --prefix={prefix}"));
        if !self.configure_args.is_empty() {
            configure.push(' ');
            configure.push_str(&quote_all(&self.configure_args));
        }
        lines.push(configure);
        lines.push(format!("make -j {jobs}"));
        lines.push("make install".to_string());
        lines.push(format!("export PATH={prefix}/bin:\"$PATH\""));
        if let Some(check) = &self.smoke_check {
            lines.push(check.clone());
        }
        lines.join("\n")
    }
}

fn install_script(installer: &str, packages: &[String], source: Option<&PackageSource>) -> String {
    let mut lines = Vec::new();
    if !packages.is_empty() {
        lines.push(format!("{installer} {}", quote_all(packages)));
    }
    match source {
        Some(PackageSource::Editable(path)) => lines.push(format!("{installer} -e {}", shell_quote(path))),
        Some(PackageSource::Index(name)) => lines.push(format!("{installer} {}", shell_quote(name))),
        None => {}
    }
    lines.join("\n")
}

/// Quote a word for POSIX `sh` if it contains anything special.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '+' | ',' | '@'));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn quote_all(words: &[String]) -> String {
    words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

/// Lowercase filesystem-safe form of a step name.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() { "step".to_string() } else { trimmed.to_string() }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn cell(os: &str, version: &str) -> MatrixCell {
        MatrixCell {
            index: 0,
            os: os.to_string(),
            version: version.to_string(),
        }
    }

    fn step(toml_src: &str) -> StepConfig {
        toml::from_str(toml_src).unwrap()
    }

    fn ws() -> PathBuf {
        PathBuf::from("/work/cell")
    }

    fn script_of(planned: &PlannedStep) -> &str {
        match &planned.plan {
            StepPlan::Shell { script, .. } => script,
            other => panic!("expected shell plan, got {other:?}"),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("libtiff5-dev"), "libtiff5-dev");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Build GMTSAR"), "build-gmtsar");
        assert_eq!(slug("  --  "), "step");
    }

    #[test]
    fn test_provision_linux_uses_apt() {
        let s = step(
            r#"
            name = "deps"
            kind = "provision"
            apt = ["csh", "gfortran"]
            brew = ["gcc"]
            runtime = { name = "python", version = "${{ matrix.version }}" }
            "#,
        );
        let planned = plan_step(&s, &cell("ubuntu-22.04", "3.11"), "ci", &ws()).unwrap();
        let script = script_of(&planned);
        assert!(script.contains("apt-get install -y --no-install-recommends csh gfortran"));
        assert!(!script.contains("brew"));
        assert!(script.contains("python3.11 --version"));
    }

    #[test]
    fn test_provision_macos_uses_brew() {
        let s = step(
            r#"
            name = "deps"
            kind = "provision"
            apt = ["csh"]
            brew = ["autoconf", "gcc"]
            "#,
        );
        let planned = plan_step(&s, &cell("macos-13", "3.10"), "ci", &ws()).unwrap();
        let script = script_of(&planned);
        assert!(script.contains("brew install autoconf gcc"));
        assert!(!script.contains("apt-get"));
    }

    #[test]
    fn test_provision_unknown_os_fails() {
        let s = step(
            r#"
            name = "deps"
            kind = "provision"
            apt = ["csh"]
            "#,
        );
        let err = plan_step(&s, &cell("windows-2022", "3.11"), "ci", &ws()).unwrap_err();
        assert!(matches!(err, CiError::UnsupportedPlatform { .. }));
    }

    #[test]
    fn test_toolkit_build_script() {
        let s = step(
            r#"
            name = "Build GMTSAR"
            kind = "toolkit_build"
            repository = "https://github.com/gmtsar/gmtsar"
            branch = "master"
            smoke_check = "gmtsar.csh"
            jobs = 4
            "#,
        );
        let planned = plan_step(&s, &cell("ubuntu-22.04", "3.11"), "ci", &ws()).unwrap();
        let StepPlan::Shell { script, path_after } = &planned.plan else {
            panic!("expected shell plan");
        };
        assert!(script.contains("git clone --depth 1 --branch master https://github.com/gmtsar/gmtsar"));
        assert!(script.contains("'-z muldefs'"));
        assert!(script.contains("./configure --prefix=\"$TESSERA_WORKSPACE/toolkit\""));
        assert!(script.contains("make -j 4"));
        assert!(script.ends_with("gmtsar.csh"));
        assert_eq!(path_after, &vec!["/work/cell/toolkit/bin".to_string()]);
    }

    #[test]
    fn test_install_editable_and_index() {
        let editable = step(
            r#"
            name = "install"
            kind = "install"
            packages = ["matplotlib", "seaborn"]
            source = { editable = "pygmtsar" }
            "#,
        );
        let planned = plan_step(&editable, &cell("ubuntu-22.04", "3.11"), "ci", &ws()).unwrap();
        assert_eq!(
            script_of(&planned),
            "python3.11 -m pip install matplotlib seaborn\npython3.11 -m pip install -e pygmtsar"
        );

        let index = step(
            r#"
            name = "install"
            kind = "install"
            installer = "pip install"
            source = { index = "pygmtsar" }
            "#,
        );
        let planned = plan_step(&index, &cell("macos-13", "3.10"), "ci", &ws()).unwrap();
        assert_eq!(script_of(&planned), "pip install pygmtsar");
    }

    #[test]
    fn test_artifact_and_path_rendering() {
        let s = step(
            r#"
            name = "upload"
            kind = "upload_artifact"
            artifact = "golden-${{ matrix.os }}-${{ matrix.version }}"
            path = "tests"
            "#,
        );
        let planned = plan_step(&s, &cell("macos-13", "3.10"), "ci", &ws()).unwrap();
        assert_eq!(
            planned.plan,
            StepPlan::Artifact {
                name: "golden-macos-13-3.10".to_string(),
                path: "tests".to_string(),
                pattern: "*.png".to_string(),
                policy: NoFilesPolicy::Error,
            }
        );

        let with_path = step(
            r#"
            name = "test"
            kind = "run"
            run = "./goldenvalley.sh"
            add_path = ["bin", "/opt/tools/bin"]
            "#,
        );
        let planned = plan_step(&with_path, &cell("macos-13", "3.10"), "ci", &ws()).unwrap();
        assert_eq!(planned.path, vec!["/work/cell/bin".to_string(), "/opt/tools/bin".to_string()]);
    }
}
