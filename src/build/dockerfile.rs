//! Dockerfile rendering from a tool's declarative `docker` config.

use std::fmt::Write;

use crate::tools::DockerConfig;
use crate::tools::resolver::ADHOC_BASE_IMAGE;

/// Render the Dockerfile for a tool's image.
///
/// Returns `None` when the config names a pre-existing image and carries no
/// build-affecting keys, since there is nothing to build. A custom
/// `dockerfile` string is returned verbatim.
pub fn render(config: &DockerConfig) -> Option<String> {
    if config.image.is_some() && !has_build_keys(config) {
        return None;
    }
    if let Some(custom) = config.dockerfile.as_deref().filter(|d| !d.trim().is_empty()) {
        return Some(custom.to_string());
    }

    let base = config.base_image.as_deref().unwrap_or(ADHOC_BASE_IMAGE);
    let run_commands = config.run_commands.as_deref().unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(out, "FROM {} as builder\n", base);

    if let Some(apt) = config.apt_packages.as_deref().filter(|p| !p.is_empty()) {
        out.push_str("RUN apt-get update && apt-get install -y \\\n");
        for pkg in apt {
            let _ = writeln!(out, "    {} \\", pkg);
        }
        out.push_str("    && rm -rf /var/lib/apt/lists/*\n\n");
    }

    if !run_commands.is_empty() {
        for cmd in run_commands {
            let _ = writeln!(out, "RUN {}", cmd);
        }
        out.push('\n');
    }

    if let Some(pip) = config.pip_packages.as_deref().filter(|p| !p.is_empty()) {
        let _ = writeln!(out, "RUN pip install --no-cache-dir {}\n", pip.join(" "));
    }

    match config.final_base.as_deref() {
        Some(final_base) => {
            let _ = writeln!(out, "FROM {}\n", final_base);
            if let Some(layer) = python_layer(final_base, true) {
                let _ = writeln!(out, "{}\n", layer);
            }

            let final_run = config.final_run_commands.as_deref().unwrap_or_default();
            if !final_run.is_empty() {
                for cmd in final_run {
                    let _ = writeln!(out, "RUN {}", cmd);
                }
                out.push('\n');
            }

            match config.copy_from_builder.as_deref().filter(|c| !c.is_empty()) {
                Some(copies) => {
                    for copy in copies {
                        let _ = writeln!(out, "COPY --from=builder {} {}", copy.src(), copy.dest());
                    }
                }
                None if run_commands.iter().any(|c| c.contains("go install")) => {
                    out.push_str("COPY --from=builder /go/bin/ /usr/local/bin/\n");
                }
                None => out.push_str("COPY --from=builder /usr/local/ /usr/local/\n"),
            }
        }
        None => {
            if let Some(layer) = python_layer(base, false) {
                let _ = writeln!(out, "{}\n", layer);
            }
        }
    }

    out.push_str("WORKDIR /app\n");
    out.push_str("ENV PYTHONUNBUFFERED=1\n");
    Some(out)
}

/// Keys whose presence means an image has to be built.
pub fn has_build_keys(config: &DockerConfig) -> bool {
    config.apt_packages.is_some()
        || config.pip_packages.is_some()
        || config.run_commands.is_some()
        || config.dockerfile.is_some()
        || config.base_image.is_some()
}

/// The layer that installs python on a base image lacking it.
///
/// Debian-family bases only get one in a final stage; a single-stage build
/// keeps whatever the base provides.
fn python_layer(base: &str, final_stage: bool) -> Option<&'static str> {
    let base = base.to_lowercase();
    if base.contains("python") {
        return None;
    }
    if base.contains("alpine") {
        return Some("RUN apk add --no-cache python3 py3-pip");
    }
    let debian_like = ["debian", "ubuntu", "slim"].iter().any(|d| base.contains(d));
    (final_stage && debian_like).then_some(
        "RUN apt-get update && apt-get install -y python3 python3-pip && rm -rf /var/lib/apt/lists/*",
    )
}
