use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use sdf_forge::compiler::MonitorTap;
use sdf_forge::graph::library::{demo_scene_2d, demo_scene_3d};
use sdf_forge::graph::Scene;
use sdf_forge::pipeline::export::save_png;
use sdf_forge::{CpuBackend, Pipeline, PipelineSettings, PipelineStage, PointCloudPipeline};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    SceneFile(PathBuf),
    Demo(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Cli {
    input: Option<Input>,
    settings: Option<PathBuf>,
    monitor: Option<MonitorTap>,
    max_stage: Option<PipelineStage>,
    size: (u32, u32),
    output: PathBuf,
    monitor_output: Option<PathBuf>,
    points: bool,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            input: None,
            settings: None,
            monitor: None,
            max_stage: None,
            size: (256, 256),
            output: PathBuf::from("out.png"),
            monitor_output: None,
            points: false,
        }
    }
}

const USAGE: &str = "usage: sdf-forge (<scene.json> | --demo 2d|3d) [--settings <file>] \
[--monitor <component>:<fragment>] [--monitor-out <file>] [--max-stage <stage>] \
[--size WxH] [--points] [-o <out.png>]";

fn parse_size(v: &str) -> Result<(u32, u32)> {
    let (w, h) = v
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("invalid --size '{v}' (expected WxH)"))?;
    let w: u32 = w.parse().with_context(|| format!("invalid width in '{v}'"))?;
    let h: u32 = h.parse().with_context(|| format!("invalid height in '{v}'"))?;
    if w == 0 || h == 0 {
        bail!("--size must be at least 1x1, got '{v}'");
    }
    Ok((w, h))
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow!("missing value for {flag}"))
    };
    while i < args.len() {
        match args[i].as_str() {
            "--demo" => {
                cli.input = Some(Input::Demo(value(i, "--demo")?));
                i += 2;
            }
            "--settings" => {
                cli.settings = Some(PathBuf::from(value(i, "--settings")?));
                i += 2;
            }
            "--monitor" => {
                let v = value(i, "--monitor")?;
                let (component, fragment) = v
                    .split_once(':')
                    .ok_or_else(|| anyhow!("invalid --monitor '{v}' (expected component:fragment)"))?;
                cli.monitor = Some(MonitorTap::new(component, fragment));
                i += 2;
            }
            "--monitor-out" => {
                cli.monitor_output = Some(PathBuf::from(value(i, "--monitor-out")?));
                i += 2;
            }
            "--max-stage" => {
                let v = value(i, "--max-stage")?;
                cli.max_stage = Some(v.parse().map_err(|e: String| anyhow!(e))?);
                i += 2;
            }
            "--size" => {
                cli.size = parse_size(&value(i, "--size")?)?;
                i += 2;
            }
            "--points" => {
                cli.points = true;
                i += 1;
            }
            "-o" | "--output" => {
                cli.output = PathBuf::from(value(i, "-o")?);
                i += 2;
            }
            other if other.starts_with('-') => {
                bail!("unknown argument: {other}\n{USAGE}");
            }
            path => {
                cli.input = Some(Input::SceneFile(PathBuf::from(path)));
                i += 1;
            }
        }
    }
    if cli.input.is_none() {
        bail!("no scene given\n{USAGE}");
    }
    Ok(cli)
}

fn load_scene(path: &Path) -> Result<Scene> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scene {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid scene json in {}", path.display()))
}

fn resolve_scene(input: &Input) -> Result<Scene> {
    match input {
        Input::SceneFile(path) => load_scene(path),
        Input::Demo(name) => match name.as_str() {
            "2d" => Ok(demo_scene_2d()),
            "3d" => Ok(demo_scene_3d()),
            other => Err(anyhow!("unknown demo '{other}' (expected 2d or 3d)")),
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let input = cli.input.as_ref().ok_or_else(|| anyhow!("no scene given"))?;
    let scene = resolve_scene(input)?;
    let mut settings = match &cli.settings {
        Some(path) => PipelineSettings::load(path)?,
        None => PipelineSettings::default(),
    };
    if let Some(stage) = cli.max_stage {
        settings.max_stage = stage;
    }
    let (w, h) = cli.size;

    if cli.points {
        let mut pipeline = PointCloudPipeline::new(CpuBackend::new(), settings);
        pipeline.build(&scene);
        pipeline.render(w as f32, h as f32)?;
        let (w, h, texels) = pipeline.read_result()?;
        save_png(&cli.output, w, h, &texels)?;
        tracing::info!(
            output = %cli.output.display(),
            visible = pipeline.visible_points(),
            "saved point cloud"
        );
        return Ok(());
    }

    let mut pipeline = Pipeline::new(CpuBackend::new(), settings);
    for diagnostic in pipeline.build(&scene, cli.monitor.as_ref()) {
        tracing::warn!(%diagnostic, "build diagnostic");
    }
    pipeline.render(w as f32, h as f32)?;
    let (rw, rh, texels) = pipeline.read_result()?;
    save_png(&cli.output, rw, rh, &texels)?;
    tracing::info!(output = %cli.output.display(), stage = %pipeline.stage(), "saved render");

    if let Some(path) = &cli.monitor_output {
        let Some((texture, channels)) = pipeline.monitor_texture() else {
            bail!("--monitor-out given but no monitor tap was compiled");
        };
        let texels = pipeline.read_texture(texture)?;
        save_png(path, rw, rh, &texels)?;
        tracing::info!(output = %path.display(), channels, "saved monitor");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&args)?;
    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_cli_demo_with_options() {
        let cli = parse_cli(&args(&[
            "--demo", "3d", "--size", "64x32", "--max-stage", "ao", "--monitor", "sphere:out", "-o",
            "render.png",
        ]))
        .unwrap();
        assert_eq!(cli.input, Some(Input::Demo("3d".into())));
        assert_eq!(cli.size, (64, 32));
        assert_eq!(cli.max_stage, Some(PipelineStage::Ao));
        assert_eq!(cli.monitor, Some(MonitorTap::new("sphere", "out")));
        assert_eq!(cli.output, PathBuf::from("render.png"));
    }

    #[test]
    fn parse_cli_scene_path() {
        let cli = parse_cli(&args(&["scene.json", "--points"])).unwrap();
        assert_eq!(cli.input, Some(Input::SceneFile(PathBuf::from("scene.json"))));
        assert!(cli.points);
    }

    #[test]
    fn parse_cli_rejects_bad_input() {
        assert!(parse_cli(&args(&[])).is_err());
        assert!(parse_cli(&args(&["--demo"])).is_err());
        assert!(parse_cli(&args(&["--demo", "2d", "--size", "0x4"])).is_err());
        assert!(parse_cli(&args(&["--demo", "2d", "--monitor", "nocolon"])).is_err());
        assert!(parse_cli(&args(&["--demo", "2d", "--bogus"])).is_err());
    }
}
