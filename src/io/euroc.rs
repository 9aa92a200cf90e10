//! EuRoC MAV dataset loader (monocular cam0 plus imu0 gyroscope).

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use image::GrayImage;
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::Deserialize;
use tracing::warn;

use crate::camera::CameraModel;
use crate::imu::{GyroSample, ImuCalib};

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

impl ImageEntry {
    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_ns as f64 * 1e-9
    }
}

#[derive(Debug, Clone)]
pub struct ImuEntry {
    pub timestamp_ns: u64,
    pub sample: GyroSample,
}

#[derive(Debug)]
pub struct EurocDataset {
    dataset_path: PathBuf,
    pub cam0_entries: Vec<ImageEntry>,
    pub imu_entries: Vec<ImuEntry>,
    pub camera: CameraModel,
    /// Camera-to-body rotation of cam0.
    pub imu_calib: ImuCalib,
}

impl EurocDataset {
    /// Load a `mav0` directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cam0_entries = load_image_list(root.join("cam0/data.csv"))?;
        let imu_entries = load_imu_list(root.join("imu0/data.csv"))?;
        let (camera, imu_calib) = load_camera(&root.join("cam0/sensor.yaml"))?;

        if imu_entries.is_empty() {
            warn!("No IMU samples in {:?}", root.join("imu0/data.csv"));
        }

        Ok(Self {
            dataset_path: root,
            cam0_entries,
            imu_entries,
            camera,
            imu_calib,
        })
    }

    pub fn len(&self) -> usize {
        self.cam0_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cam0_entries.is_empty()
    }

    pub fn image(&self, idx: usize) -> Result<GrayImage> {
        let entry = self
            .cam0_entries
            .get(idx)
            .with_context(|| format!("No frame at index {}", idx))?;
        let path = self.dataset_path.join("cam0/data").join(&entry.filename);
        let img = image::open(&path).with_context(|| format!("Failed to read image {:?}", path))?;
        Ok(img.to_luma8())
    }

    /// Gyro samples with `t_ns_start <= t <= t_ns_end`.
    pub fn gyro_between(&self, t_ns_start: u64, t_ns_end: u64) -> Vec<GyroSample> {
        let start = self
            .imu_entries
            .partition_point(|e| e.timestamp_ns < t_ns_start);
        self.imu_entries[start..]
            .iter()
            .take_while(|e| e.timestamp_ns <= t_ns_end)
            .map(|e| e.sample)
            .collect()
    }
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let filename = rec[1].trim().to_string();
        entries.push(ImageEntry {
            timestamp_ns: ts,
            filename,
        });
    }
    Ok(entries)
}

fn load_imu_list(csv_path: PathBuf) -> Result<Vec<ImuEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // timestamp, w_x, w_y, w_z, a_x, a_y, a_z; the accelerometer is unused.
        if rec.len() < 4 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let gyro = Vector3::new(
            rec[1].trim().parse()?,
            rec[2].trim().parse()?,
            rec[3].trim().parse()?,
        );
        entries.push(ImuEntry {
            timestamp_ns: ts,
            sample: GyroSample::new(ts as f64 * 1e-9, gyro),
        });
    }
    Ok(entries)
}

/// EuRoC T_BS transform format: has cols, rows, data fields
#[derive(Debug, Deserialize)]
struct TransformYaml {
    data: Vec<f64>,
}

/// EuRoC camera sensor.yaml format
#[derive(Debug, Deserialize)]
struct CameraYaml {
    #[serde(rename = "T_BS")]
    t_bs: TransformYaml,
    /// [width, height]
    resolution: Vec<usize>,
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
    /// [k1, k2, p1, p2] or [k1, k2, p1, p2, k3]
    #[serde(default)]
    distortion_coefficients: Vec<f64>,
}

fn load_camera(path: &Path) -> Result<(CameraModel, ImuCalib)> {
    let yaml: CameraYaml = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )
    .with_context(|| format!("Failed to parse {:?}", path))?;

    if yaml.intrinsics.len() != 4 {
        bail!(
            "Expected 4 intrinsics [fx, fy, cx, cy], got {}",
            yaml.intrinsics.len()
        );
    }
    if yaml.resolution.len() != 2 {
        bail!("Expected resolution [width, height], got {:?}", yaml.resolution);
    }
    if yaml.distortion_coefficients.len() > 5 {
        bail!(
            "Expected at most 5 distortion coefficients, got {}",
            yaml.distortion_coefficients.len()
        );
    }

    let k = &yaml.intrinsics;
    let camera = CameraModel::new(k[0], k[1], k[2], k[3], yaml.resolution[0], yaml.resolution[1])
        .with_distortion(&yaml.distortion_coefficients);

    let r_bc = rotation_from(&yaml.t_bs.data)?;
    Ok((camera, ImuCalib::new(r_bc)))
}

fn rotation_from(data: &[f64]) -> Result<Matrix3<f64>> {
    if data.len() != 16 {
        bail!("Expected 16 elements for transform, got {}", data.len());
    }
    let mat = Matrix4::from_row_slice(data);
    Ok(mat.fixed_view::<3, 3>(0, 0).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SENSOR_YAML: &str = "\
sensor_type: camera
comment: VI-Sensor cam0 (MT9M034)
T_BS:
  cols: 4
  rows: 4
  data: [0.0148655429818, -0.999880929698, 0.00414029679422, -0.0216401454975,
         0.999557249008, 0.0149672133247, 0.025715529948, -0.064676986768,
        -0.0257744366974, 0.00375618835797, 0.999660727178, 0.00981073058949,
         0.0, 0.0, 0.0, 1.0]
rate_hz: 20
resolution: [752, 480]
camera_model: pinhole
intrinsics: [458.654, 457.296, 367.215, 248.375]
distortion_model: radial-tangential
distortion_coefficients: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05]
";

    fn write_dataset(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("euroc_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("cam0/data")).unwrap();
        fs::create_dir_all(root.join("imu0")).unwrap();
        fs::write(root.join("cam0/sensor.yaml"), SENSOR_YAML).unwrap();
        fs::write(
            root.join("cam0/data.csv"),
            "#timestamp [ns],filename\n1000000000,a.png\n1050000000,b.png\n",
        )
        .unwrap();
        let mut imu = String::from("#timestamp [ns],w_x,w_y,w_z,a_x,a_y,a_z\n");
        for k in 0..12u64 {
            let ts = 995_000_000 + k * 5_000_000;
            imu.push_str(&format!("{ts},0.1,-0.2,0.3,9.8,0.0,0.0\n"));
        }
        fs::write(root.join("imu0/data.csv"), imu).unwrap();
        root
    }

    #[test]
    fn test_loads_calibration() {
        let root = write_dataset("calib");
        let ds = EurocDataset::new(&root).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.camera.width, 752);
        assert_eq!(ds.camera.height, 480);
        assert_eq!(ds.camera.fx, 458.654);
        assert_eq!(ds.camera.distortion[0], -0.28340811);
        assert_eq!(ds.camera.distortion[4], 0.0);
        assert!((ds.imu_calib.r_bc[(1, 0)] - 0.999557249008).abs() < 1e-12);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_gyro_between_is_inclusive() {
        let root = write_dataset("gyro");
        let ds = EurocDataset::new(&root).unwrap();

        let t0 = ds.cam0_entries[0].timestamp_ns;
        let t1 = ds.cam0_entries[1].timestamp_ns;
        let samples = ds.gyro_between(t0, t1);
        // 1.000 s .. 1.050 s in 5 ms steps.
        assert_eq!(samples.len(), 11);
        assert!((samples[0].timestamp_s - 1.0).abs() < 1e-12);
        assert_eq!(samples[0].gyro, Vector3::new(0.1, -0.2, 0.3));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_missing_directory_fails() {
        assert!(EurocDataset::new("/nonexistent/mav0").is_err());
    }
}
