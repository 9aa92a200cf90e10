use anyhow::{Context, Result};
use image::GrayImage;
use imageproc::corners::corners_fast9;
use nalgebra::Point2;
use tracing::info;

use gyro_aided_tracker::camera::CameraModel;
use gyro_aided_tracker::imu::GyroBias;
use gyro_aided_tracker::io::euroc::{EurocDataset, ImageEntry};
use gyro_aided_tracker::tracking::{FrameData, GyroAidedTracker, TrackerConfig};

const FAST_THRESHOLD: u8 = 20;
const MAX_FEATURES: usize = 1000;

/// A loaded frame kept around as the next reference.
struct Frame {
    entry: ImageEntry,
    image: GrayImage,
    keys: Vec<Point2<f64>>,
    keys_un: Vec<Point2<f64>>,
}

/// FAST corners as distorted and undistorted keypoints, strongest first.
fn detect(img: &GrayImage, camera: &CameraModel) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
    let mut corners = corners_fast9(img, FAST_THRESHOLD);
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));
    corners.truncate(MAX_FEATURES);

    let keys: Vec<Point2<f64>> = corners
        .iter()
        .map(|c| Point2::new(c.x as f64, c.y as f64))
        .collect();
    let keys_un = keys.iter().map(|p| camera.undistort_pixel(p)).collect();
    (keys, keys_un)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let dataset_path = args
        .next()
        .unwrap_or_else(|| "data/euroc/MH_01_easy/mav0".to_string());
    let config = match args.next() {
        Some(path) => TrackerConfig::from_yaml_file(&path)?,
        None => TrackerConfig::default(),
    };

    info!("Loading EuRoC dataset from: {}", dataset_path);
    let dataset = EurocDataset::new(&dataset_path)?;
    info!(
        frames = dataset.len(),
        imu = dataset.imu_entries.len(),
        mode = config.mode.code(),
        "loaded dataset"
    );

    let camera = &dataset.camera;
    let bias = GyroBias::zero();

    let mut prev: Option<Frame> = None;
    let mut total_valid = 0usize;
    let mut total_ref = 0usize;

    for i in 0..dataset.len() {
        let img = dataset
            .image(i)
            .with_context(|| format!("frame {}", i))?;
        let (keys, keys_un) = detect(&img, camera);
        let entry = &dataset.cam0_entries[i];

        if let Some(r) = &prev {
            let gyro = dataset.gyro_between(r.entry.timestamp_ns, entry.timestamp_ns);

            let mut tracker = GyroAidedTracker::new(
                FrameData {
                    timestamp: r.entry.timestamp_s(),
                    image: &r.image,
                    keypoints: &r.keys,
                    keypoints_un: &r.keys_un,
                },
                FrameData {
                    timestamp: entry.timestamp_s(),
                    image: &img,
                    keypoints: &keys,
                    keypoints_un: &keys_un,
                },
                &gyro,
                bias,
                dataset.imu_calib,
                camera,
                &config,
            )?;
            let valid = tracker.run();

            total_valid += valid;
            total_ref += tracker.num_features();
            if i % 100 == 0 {
                let m = tracker.metrics();
                info!(
                    frame = i,
                    features = m.n_ref_keys,
                    matches = m.n_matches,
                    valid,
                    total_ms = tracker.timing().feature_track_total() * 1e3,
                    "frame summary"
                );
            }
        }

        prev = Some(Frame {
            entry: entry.clone(),
            image: img,
            keys,
            keys_un,
        });
    }

    let rate = if total_ref > 0 {
        100.0 * total_valid as f64 / total_ref as f64
    } else {
        0.0
    };
    info!(total_valid, total_ref, "overall track rate {:.2}%", rate);
    Ok(())
}
