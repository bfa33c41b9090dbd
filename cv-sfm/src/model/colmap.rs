//! Reading and writing of the COLMAP text format: `cameras.txt`, `images.txt` and `points3D.txt`.

use super::{
    Camera, CameraId, CameraKind, Image, ImageId, Observation, Reconstruction, Track, TrackElement,
    TrackId,
};
use crate::{Error, Result};
use cv_core::nalgebra::{Quaternion, UnitQuaternion, Vector3};
use cv_core::{KeyPoint, WorldPoint, WorldToCamera};
use log::*;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::{FromStr, SplitWhitespace};

pub const CAMERAS_FILE: &str = "cameras.txt";
pub const IMAGES_FILE: &str = "images.txt";
pub const POINTS_FILE: &str = "points3D.txt";

/// Whitespace separated fields of one line, producing parse errors that carry the location.
struct Fields<'a> {
    path: &'a Path,
    line: usize,
    tokens: SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(path: &'a Path, line: usize, text: &'a str) -> Self {
        Self {
            path,
            line,
            tokens: text.split_whitespace(),
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(self.path, self.line, message)
    }

    fn next_str(&mut self, what: &str) -> Result<&'a str> {
        let line = self.line;
        let path = self.path;
        self.tokens
            .next()
            .ok_or_else(|| Error::parse(path, line, format!("missing {}", what)))
    }

    fn next<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next_str(what)?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid {} `{}`", what, token)))
    }

    fn rest(&mut self) -> Vec<&'a str> {
        self.tokens.by_ref().collect()
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

/// Lines that carry data, numbered from 1.
fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(ix, line)| (ix + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Reads a reconstruction from a directory holding the three text files.
pub fn read_text_model(dir: impl AsRef<Path>) -> Result<Reconstruction> {
    let dir = dir.as_ref();
    let mut reconstruction = Reconstruction::default();

    let path = dir.join(CAMERAS_FILE);
    let text = read_file(&path)?;
    for (line, data) in data_lines(&text) {
        let mut fields = Fields::new(&path, line, data);
        let id = CameraId(fields.next("camera id")?);
        let kind_name = fields.next_str("camera model")?;
        let kind = CameraKind::from_name(kind_name)
            .ok_or_else(|| fields.error(format!("unsupported camera model `{}`", kind_name)))?;
        let width = fields.next("width")?;
        let height = fields.next("height")?;
        let params = fields
            .rest()
            .into_iter()
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| Error::parse(&path, line, format!("invalid parameter `{}`", token)))
            })
            .collect::<Result<Vec<f64>>>()?;
        if params.len() != kind.num_params() {
            return Err(fields.error(format!(
                "{} expects {} parameters, found {}",
                kind.name(),
                kind.num_params(),
                params.len()
            )));
        }
        reconstruction.cameras.insert(
            id,
            Camera {
                id,
                kind,
                width,
                height,
                params,
            },
        );
    }

    let path = dir.join(IMAGES_FILE);
    let text = read_file(&path)?;
    let mut lines = text.lines().enumerate().map(|(ix, line)| (ix + 1, line.trim()));
    while let Some((line, data)) = lines.next() {
        if data.is_empty() || data.starts_with('#') {
            continue;
        }
        let mut fields = Fields::new(&path, line, data);
        let id = ImageId(fields.next("image id")?);
        let mut q = [0.0f64; 4];
        for (component, name) in q.iter_mut().zip(["qw", "qx", "qy", "qz"]) {
            *component = fields.next(name)?;
        }
        let mut t = [0.0f64; 3];
        for (component, name) in t.iter_mut().zip(["tx", "ty", "tz"]) {
            *component = fields.next(name)?;
        }
        let camera = CameraId(fields.next("camera id")?);
        let name = fields.rest().join(" ");
        if name.is_empty() {
            return Err(fields.error("missing image name"));
        }
        if !reconstruction.cameras.contains_key(&camera) {
            return Err(fields.error(format!("unknown camera {}", camera)));
        }
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]));
        let pose =
            WorldToCamera::from_quaternion_translation(rotation, Vector3::new(t[0], t[1], t[2]));

        let (points_line, points_data) = lines.next().unwrap_or((line + 1, ""));
        let mut fields = Fields::new(&path, points_line, points_data);
        let tokens = fields.rest();
        if tokens.len() % 3 != 0 {
            return Err(fields.error("observations must be triples of x, y, point id"));
        }
        let observations = tokens
            .chunks(3)
            .map(|chunk| {
                let parse = |token: &str| {
                    token.parse::<f64>().map_err(|_| {
                        Error::parse(&path, points_line, format!("invalid coordinate `{}`", token))
                    })
                };
                let track = match chunk[2].parse::<i64>() {
                    Ok(-1) => None,
                    Ok(id) if id >= 0 && id <= u32::MAX as i64 => Some(TrackId(id as u32)),
                    _ => {
                        return Err(Error::parse(
                            &path,
                            points_line,
                            format!("invalid point id `{}`", chunk[2]),
                        ))
                    }
                };
                Ok(Observation {
                    keypoint: KeyPoint::new(parse(chunk[0])?, parse(chunk[1])?),
                    track,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        reconstruction.images.insert(
            id,
            Image {
                id,
                name,
                camera,
                pose,
                observations,
            },
        );
    }

    let path = dir.join(POINTS_FILE);
    let text = read_file(&path)?;
    for (line, data) in data_lines(&text) {
        let mut fields = Fields::new(&path, line, data);
        let id = TrackId(fields.next("point id")?);
        let position = WorldPoint::new(fields.next("x")?, fields.next("y")?, fields.next("z")?);
        let color = [fields.next("r")?, fields.next("g")?, fields.next("b")?];
        let error = fields.next("error")?;
        let tokens = fields.rest();
        if tokens.len() % 2 != 0 {
            return Err(fields.error("track must be pairs of image id, point2d index"));
        }
        let elements = tokens
            .chunks(2)
            .map(|chunk| {
                let image = chunk[0].parse::<u32>().map(ImageId);
                let observation = chunk[1].parse::<usize>();
                match (image, observation) {
                    (Ok(image), Ok(observation)) => Ok(TrackElement { image, observation }),
                    _ => Err(Error::parse(
                        &path,
                        line,
                        format!("invalid track element `{} {}`", chunk[0], chunk[1]),
                    )),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        reconstruction.tracks.insert(
            id,
            Track {
                id,
                position,
                color,
                error,
                elements,
            },
        );
    }

    info!(
        "read model with {} cameras, {} images and {} tracks from {}",
        reconstruction.cameras.len(),
        reconstruction.images.len(),
        reconstruction.tracks.len(),
        dir.display()
    );
    Ok(reconstruction)
}

/// Writes a reconstruction into a directory, creating it if needed.
pub fn write_text_model(dir: impl AsRef<Path>, reconstruction: &Reconstruction) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut text = String::new();
    text.push_str("# Camera list with one line of data per camera:\n");
    text.push_str("#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]\n");
    let _ = writeln!(text, "# Number of cameras: {}", reconstruction.cameras.len());
    for camera in reconstruction.cameras.values() {
        let _ = write!(
            text,
            "{} {} {} {}",
            camera.id,
            camera.kind.name(),
            camera.width,
            camera.height
        );
        for param in &camera.params {
            let _ = write!(text, " {}", param);
        }
        text.push('\n');
    }
    write_file(&dir.join(CAMERAS_FILE), &text)?;

    let mut text = String::new();
    text.push_str("# Image list with two lines of data per image:\n");
    text.push_str("#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME\n");
    text.push_str("#   POINTS2D[] as (X, Y, POINT3D_ID)\n");
    let _ = writeln!(text, "# Number of images: {}", reconstruction.images.len());
    for image in reconstruction.images.values() {
        let q = image.pose.quaternion();
        let t = image.pose.translation();
        let _ = writeln!(
            text,
            "{} {} {} {} {} {} {} {} {} {}",
            image.id, q.w, q.i, q.j, q.k, t.x, t.y, t.z, image.camera, image.name
        );
        let observations = image
            .observations
            .iter()
            .map(|observation| {
                let track = observation
                    .track
                    .map(|id| id.0 as i64)
                    .unwrap_or(-1);
                format!("{} {} {}", observation.keypoint.x, observation.keypoint.y, track)
            })
            .collect::<Vec<_>>()
            .join(" ");
        text.push_str(&observations);
        text.push('\n');
    }
    write_file(&dir.join(IMAGES_FILE), &text)?;

    let mut text = String::new();
    text.push_str("# 3D point list with one line of data per point:\n");
    text.push_str("#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)\n");
    let _ = writeln!(text, "# Number of points: {}", reconstruction.tracks.len());
    for track in reconstruction.tracks.values() {
        let p = track.position.0;
        let _ = write!(
            text,
            "{} {} {} {} {} {} {} {}",
            track.id, p.x, p.y, p.z, track.color[0], track.color[1], track.color[2], track.error
        );
        for element in &track.elements {
            let _ = write!(text, " {} {}", element.image, element.observation);
        }
        text.push('\n');
    }
    write_file(&dir.join(POINTS_FILE), &text)?;

    info!(
        "wrote model with {} images and {} tracks to {}",
        reconstruction.images.len(),
        reconstruction.tracks.len(),
        dir.display()
    );
    Ok(())
}

fn write_file(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).map_err(|e| Error::io(path, e))
}
