use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use stereo_scene::{
    Calibration, CalibrationParams, Direction, Distance, FrameReport, MockObstacle, MockScene,
    MockStereoSource, Rect, SceneSensor, SensorConfig,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "scene",
    version,
    about = "Stereo depth pipeline and scene queries",
    disable_help_subcommand = true
)]
struct Cli {
    /// Sensor config YAML; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the disparity to distance table
    Lut {
        /// Depth image width in pixels
        #[arg(long)]
        width: Option<u32>,
        /// Horizontal field of view in degrees
        #[arg(long)]
        fov: Option<f32>,
        /// Stereo baseline in millimeters
        #[arg(long)]
        baseline: Option<f32>,
        /// Read calibration parameters from YAML instead
        #[arg(long)]
        calib: Option<String>,
        /// Write the derived calibration parameters to YAML
        #[arg(long)]
        save: Option<String>,
    },
    /// Run the pipeline on the synthetic source and print scene queries as JSON
    Run {
        #[arg(long, default_value_t = 5u32)]
        frames: u32,
        /// Distance of the synthetic obstacle in millimeters
        #[arg(long, default_value_t = 1200u16)]
        obstacle_mm: u16,
        /// Print Prometheus text metrics after the run
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Grab one frame and write its point cloud as PLY
    ExportPly {
        #[arg(long, default_value = "cloud.ply")]
        out: String,
        /// Region of interest as x,y,w,h
        #[arg(long)]
        roi: Option<String>,
        #[arg(long, default_value_t = 1200u16)]
        obstacle_mm: u16,
    },
    /// Print the effective config as YAML
    ConfigDump,
}

#[derive(Serialize)]
struct FrameOutput {
    report: FrameReport,
    nearest_mm: u16,
    nearest_point: Option<[i32; 2]>,
    obstacle_rect: Option<Rect>,
    farthest_point: Option<[i32; 2]>,
    bypass_deg: f32,
    dead_zone: bool,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Lut {
            width,
            fov,
            baseline,
            calib,
            save,
        } => print_lut(&config, width, fov, baseline, calib.as_deref(), save.as_deref()),
        Commands::Run {
            frames,
            obstacle_mm,
            metrics,
        } => run(config, frames, obstacle_mm, metrics),
        Commands::ExportPly {
            out,
            roi,
            obstacle_mm,
        } => export_ply(config, &out, roi.as_deref(), obstacle_mm),
        Commands::ConfigDump => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn setup_tracing() {
    // a subscriber installed by an embedding test harness wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(path: Option<&str>) -> Result<SensorConfig> {
    match path {
        Some(p) => SensorConfig::from_yaml_file(p).with_context(|| format!("loading {p}")),
        None => Ok(SensorConfig::default()),
    }
}

fn print_lut(
    config: &SensorConfig,
    width: Option<u32>,
    fov: Option<f32>,
    baseline: Option<f32>,
    calib: Option<&str>,
    save: Option<&str>,
) -> Result<()> {
    let params = match calib {
        Some(path) => stereo_scene::calib::read_yaml(path).with_context(|| format!("reading {path}"))?,
        None => {
            let width = width.unwrap_or(config.depth_width);
            CalibrationParams::from_fov(
                width,
                width * 3 / 4,
                fov.unwrap_or(config.fov_deg),
                baseline.unwrap_or(config.baseline_mm),
            )
        }
    };
    let cal = Calibration::new(params).context("building calibration")?;
    if let Some(path) = save {
        stereo_scene::calib::write_yaml(cal.params(), path)
            .with_context(|| format!("writing {path}"))?;
        info!("saved calibration to {path}");
    }
    println!(
        "# f={:.3}px range=[{}, {}]mm",
        cal.params().focal_px,
        cal.min_distance(),
        cal.max_distance()
    );
    for (d, mm) in cal.table().iter().enumerate() {
        println!("{d}\t{mm}");
    }
    Ok(())
}

fn mock_source(config: &SensorConfig, obstacle_mm: u16) -> MockStereoSource {
    let scene = MockScene {
        width: config.depth_width,
        height: config.depth_height(),
        fov_deg: config.fov_deg,
        baseline_mm: config.baseline_mm,
        obstacles: vec![MockObstacle {
            rect: Rect::new(
                (config.depth_width * 7 / 16) as i32,
                (config.depth_height() * 3 / 8) as i32,
                (config.depth_width / 8) as i32,
                (config.depth_height() * 5 / 12) as i32,
            ),
            distance_mm: obstacle_mm,
        }],
        ..MockScene::default()
    };
    MockStereoSource::new(scene)
}

fn run(config: SensorConfig, frames: u32, obstacle_mm: u16, metrics: bool) -> Result<()> {
    let source = mock_source(&config, obstacle_mm);
    let mut sensor = SceneSensor::new();
    sensor
        .start_with_source(source, config)
        .context("starting sensor")?;
    info!("running {frames} frames");
    for _ in 0..frames {
        let report = sensor.process_frame().context("processing frame")?;
        let out = FrameOutput {
            nearest_mm: sensor.nearest_distance().raw(),
            nearest_point: sensor.nearest_point().map(|p| [p.image.x, p.image.y]),
            obstacle_rect: sensor.nearest_obstacle().map(|o| o.object.bounding_rect),
            farthest_point: sensor.farthest_point().map(|p| [p.image.x, p.image.y]),
            bypass_deg: sensor.bypass_direction().raw(),
            dead_zone: report.dead_zone,
            report,
        };
        println!("{}", serde_json::to_string(&out)?);
    }
    if metrics {
        if let Some(m) = sensor.metrics() {
            print!("{}", m.encode_text());
        }
    }
    sensor.stop();
    Ok(())
}

fn parse_roi(s: &str) -> Result<Rect> {
    let parts: Vec<i32> = s
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid roi '{s}'"))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Rect::new(*x, *y, *w, *h)),
        _ => anyhow::bail!("roi must be x,y,w,h"),
    }
}

fn export_ply(config: SensorConfig, out: &str, roi: Option<&str>, obstacle_mm: u16) -> Result<()> {
    let source = mock_source(&config, obstacle_mm);
    let mut sensor = SceneSensor::new();
    sensor
        .start_with_source(source, config)
        .context("starting sensor")?;
    let report = sensor.process_frame()?;
    if let Some(r) = roi {
        sensor.set_roi(parse_roi(r)?)?;
    }
    let n = sensor.export_ply(out).with_context(|| format!("writing {out}"))?;
    let nearest = match sensor.nearest_distance() {
        Distance::Millimetres(mm) => format!("{mm}mm"),
        Distance::NoReading => "none".to_string(),
    };
    let heading = match sensor.bypass_direction() {
        Direction::Degrees(d) => format!("{d:.1}deg"),
        Direction::Undefined => "blocked".to_string(),
    };
    println!(
        "frame {}: wrote {n} points to {out} (nearest {nearest}, bypass {heading})",
        report.frame_index
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roi() {
        assert_eq!(parse_roi("1, 2,30,40").unwrap(), Rect::new(1, 2, 30, 40));
        assert!(parse_roi("1,2,3").is_err());
        assert!(parse_roi("a,b,c,d").is_err());
    }

    #[test]
    fn test_mock_source_scales_with_config() {
        let cfg = SensorConfig {
            depth_width: 320,
            ..SensorConfig::default()
        };
        let mut sensor = SceneSensor::new();
        sensor
            .start_with_source(mock_source(&cfg, 1500), cfg)
            .unwrap();
        let report = sensor.process_frame().unwrap();
        assert!(report.has_depth);
        assert_eq!(sensor.depth().map(|d| (d.width(), d.height())), Some((320, 240)));
    }
}
