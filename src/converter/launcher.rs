//! Launcher script, desktop entry and icon for an installed application.

use crate::converter::{
    error::{Error, ErrorExt, Result},
    runtime::RUNTIME_EXECUTABLE,
    utils::fs,
};
use handlebars::Handlebars;
use icns::IconFamily;
use serde::Serialize;
use std::io::BufReader;
use std::path::{Path, PathBuf};

const LAUNCHER_TEMPLATE: &str = r#"#!/bin/sh
# {{product_name}} launcher
HERE="$(dirname "$(readlink -f "$0")")"
exec "$HERE/{{runtime}}" "$HERE/resources/app.asar"{{#if start_url}} --start-url={{start_url}}{{/if}} "$@"
"#;

const DESKTOP_TEMPLATE: &str = r#"[Desktop Entry]
Type=Application
Name={{product_name}}
Exec="{{exec}}" %U
{{#if icon}}Icon={{icon}}
{{/if}}Terminal=false
Categories=Utility;
StartupWMClass={{product_name}}
"#;

/// Inputs for the generated entry points.
#[derive(Debug, Clone, Serialize)]
pub struct Launcher {
    /// Human-readable product name
    pub product_name: String,
    /// Launcher file name
    pub launcher_name: String,
    /// URL passed to the application at startup
    pub start_url: Option<String>,
}

/// Files written by [`Launcher::write`].
#[derive(Debug, Clone)]
pub struct LauncherFiles {
    /// Executable launcher script
    pub script: PathBuf,
    /// Freedesktop entry
    pub desktop_entry: PathBuf,
}

impl Launcher {
    fn registry() -> Result<Handlebars<'static>> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("launcher", LAUNCHER_TEMPLATE)
            .map_err(|e| Error::GenericError(format!("launcher template: {e}")))?;
        handlebars
            .register_template_string("desktop", DESKTOP_TEMPLATE)
            .map_err(|e| Error::GenericError(format!("desktop entry template: {e}")))?;
        Ok(handlebars)
    }

    /// Renders the launcher script.
    pub fn render_script(&self) -> Result<String> {
        let data = serde_json::json!({
            "product_name": self.product_name,
            "runtime": RUNTIME_EXECUTABLE,
            "start_url": self.start_url.as_deref().map(shell_quote),
        });
        Ok(Self::registry()?.render("launcher", &data)?)
    }

    /// Renders the desktop entry for an application installed at
    /// `install_dir`.
    pub fn render_desktop_entry(&self, install_dir: &Path, icon: Option<&Path>) -> Result<String> {
        let data = serde_json::json!({
            "product_name": self.product_name,
            "exec": install_dir.join(&self.launcher_name).display().to_string(),
            "icon": icon.map(|i| i.display().to_string()),
        });
        Ok(Self::registry()?.render("desktop", &data)?)
    }

    /// Writes the launcher script and desktop entry into `output_dir`.
    ///
    /// `install_dir` is where `output_dir` will finally live; the desktop
    /// entry refers to it. `icon` is relative to `output_dir`.
    pub async fn write(
        &self,
        output_dir: &Path,
        install_dir: &Path,
        icon: Option<&Path>,
    ) -> Result<LauncherFiles> {
        let script = output_dir.join(&self.launcher_name);
        tokio::fs::write(&script, self.render_script()?)
            .await
            .fs_context("writing launcher", &script)?;
        fs::make_executable(&script).await?;

        let installed_icon = icon.map(|i| install_dir.join(i));
        let desktop_entry = output_dir.join(format!("{}.desktop", self.launcher_name));
        let entry = self.render_desktop_entry(install_dir, installed_icon.as_deref())?;
        tokio::fs::write(&desktop_entry, entry)
            .await
            .fs_context("writing desktop entry", &desktop_entry)?;

        log::debug!("Wrote launcher {}", script.display());
        Ok(LauncherFiles {
            script,
            desktop_entry,
        })
    }
}

/// Single-quotes `value` for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Installs the application icon into `output_dir` as `<name>.png`, or as the
/// original `.icns` when no member of the family can be decoded.
///
/// Returns the icon path relative to `output_dir`.
pub async fn install_icon(icns: &Path, output_dir: &Path, name: &str) -> Result<PathBuf> {
    let png = PathBuf::from(format!("{name}.png"));
    let source = icns.to_path_buf();
    let target = output_dir.join(&png);

    let converted = tokio::task::spawn_blocking(move || largest_png(&source, &target))
        .await
        .map_err(|e| Error::GenericError(format!("icon conversion task failed: {e}")))?;

    match converted {
        Ok(()) => Ok(png),
        Err(e) => {
            log::warn!("Could not convert {}: {}; keeping the original", icns.display(), e);
            let raw = PathBuf::from(format!("{name}.icns"));
            fs::copy_file(icns, &output_dir.join(&raw)).await?;
            Ok(raw)
        }
    }
}

fn largest_png(icns: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(icns).fs_context("opening icon", icns)?;
    let family = IconFamily::read(BufReader::new(file)).fs_context("reading icon family", icns)?;

    let mut types = family.available_icons();
    types.sort_by_key(|t| std::cmp::Reverse(t.pixel_width()));

    for icon_type in types {
        let Ok(image) = family.get_icon_with_type(icon_type) else {
            continue;
        };
        let out = std::fs::File::create(target).fs_context("creating icon", target)?;
        image
            .write_png(std::io::BufWriter::new(out))
            .fs_context("writing icon", target)?;
        log::debug!(
            "Converted {} ({}px) to {}",
            icns.display(),
            icon_type.pixel_width(),
            target.display()
        );
        return Ok(());
    }

    Err(Error::InputValidation(format!(
        "{} contains no decodable icon",
        icns.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(start_url: Option<&str>) -> Launcher {
        Launcher {
            product_name: "Claude".into(),
            launcher_name: "claude-desktop".into(),
            start_url: start_url.map(str::to_string),
        }
    }

    #[test]
    fn test_script_without_start_url() {
        let script = launcher(None).render_script().unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(r#"exec "$HERE/electron" "$HERE/resources/app.asar" "$@""#));
        assert!(!script.contains("--start-url"));
    }

    #[test]
    fn test_script_quotes_start_url() {
        let script = launcher(Some("https://example.com/?q='x'&a=1"))
            .render_script()
            .unwrap();
        assert!(script.contains(r#"--start-url='https://example.com/?q='\''x'\''&a=1'"#));
    }

    #[test]
    fn test_desktop_entry_points_at_install_dir() {
        let icon = Path::new("/opt/claude/claude-desktop.png");
        let entry = launcher(None)
            .render_desktop_entry(Path::new("/opt/claude"), Some(icon))
            .unwrap();
        assert!(entry.contains("Exec=\"/opt/claude/claude-desktop\" %U\n"));
        assert!(entry.contains("Icon=/opt/claude/claude-desktop.png\n"));
        assert!(entry.contains("Name=Claude\n"));
    }

    #[tokio::test]
    async fn test_undecodable_icon_is_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let icns = tmp.path().join("app.icns");
        std::fs::write(&icns, b"not an icon family").unwrap();

        let rel = install_icon(&icns, tmp.path(), "claude-desktop").await.unwrap();
        assert_eq!(rel, PathBuf::from("claude-desktop.icns"));
        assert!(tmp.path().join(&rel).is_file());
    }
}
