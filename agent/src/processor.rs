// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Screenshot post-processing
//!
//! Turns a raw frame into an upright, opaque PNG stored under
//! `<output>/<class>/<method>/<name>`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::RgbaImage;
use image::imageops;
use log::{debug, info, warn};
use shutter_protocol::naming::{is_safe_component, sanitize_component};
use shutter_protocol::{Orientation, ScreenshotRequest};

use crate::capture::CapturedFrame;
use crate::{AgentError, Result};

/// Extension appended to names that do not already carry it
pub const EXTENSION: &str = "png";

/// Clockwise rotation applied before storing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Clockwise90,
    Clockwise180,
    Clockwise270,
}

impl Rotation {
    /// Rotation that brings a `width` x `height` frame captured in
    /// `orientation` upright.
    ///
    /// A landscape request whose frame is already wider than tall was
    /// captured in portrait buffer layout and needs a quarter turn back.
    pub fn for_frame(orientation: Orientation, width: u32, height: u32) -> Self {
        match orientation {
            Orientation::Portrait => Rotation::None,
            Orientation::Landscape if height < width => Rotation::Clockwise270,
            Orientation::Landscape => Rotation::None,
            Orientation::ReversePortrait => Rotation::Clockwise180,
            Orientation::ReverseLandscape => Rotation::Clockwise90,
        }
    }

    pub fn apply(self, image: RgbaImage) -> RgbaImage {
        match self {
            Rotation::None => image,
            Rotation::Clockwise90 => imageops::rotate90(&image),
            Rotation::Clockwise180 => imageops::rotate180(&image),
            Rotation::Clockwise270 => imageops::rotate270(&image),
        }
    }
}

/// Where processed screenshots go
pub trait Persistence: Send {
    /// Store `image` at `path`, creating parent directories as needed.
    fn write(&mut self, path: &Path, image: &RgbaImage) -> io::Result<()>;
}

/// Writes 8-bit RGBA PNG files
#[derive(Debug, Default, Clone, Copy)]
pub struct PngFiles;

impl Persistence for PngFiles {
    fn write(&mut self, path: &Path, image: &RgbaImage) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        write_png(&mut writer, image).map_err(io::Error::other)?;
        writer.flush()
    }
}

fn write_png<W: Write>(w: W, image: &RgbaImage) -> std::result::Result<(), png::EncodingError> {
    let mut encoder = png::Encoder::new(w, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(image.as_raw())?;
    writer.finish()
}

/// Test identity screenshots are grouped by
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestIdentifier {
    pub class_name: String,
    pub method_name: String,
}

impl TestIdentifier {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl From<&ScreenshotRequest> for TestIdentifier {
    fn from(request: &ScreenshotRequest) -> Self {
        Self::new(request.class_name.clone(), request.method_name.clone())
    }
}

/// Rotates and stores captured frames
pub struct ScreenshotProcessor<P = PngFiles> {
    output_root: PathBuf,
    persistence: P,
    screenshots: BTreeMap<TestIdentifier, Vec<PathBuf>>,
}

impl ScreenshotProcessor<PngFiles> {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self::with_persistence(output_root, PngFiles)
    }
}

impl<P: Persistence> ScreenshotProcessor<P> {
    pub fn with_persistence(output_root: impl Into<PathBuf>, persistence: P) -> Self {
        Self {
            output_root: output_root.into(),
            persistence,
            screenshots: BTreeMap::new(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Delete everything under the output root and forget recorded
    /// screenshots.
    pub fn clear_output(&mut self) -> Result<()> {
        let root = self.output_root.clone();
        info!("Clearing screenshot output {}", root.display());

        let removed = match fs::remove_dir_all(&root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        removed
            .and_then(|()| fs::create_dir_all(&root))
            .map_err(|source| AgentError::Persistence { path: root, source })?;

        self.screenshots.clear();
        Ok(())
    }

    /// Path a request's screenshot is stored at. Every component is
    /// sanitized so the result always stays below the output root.
    pub fn output_path(&self, request: &ScreenshotRequest) -> PathBuf {
        let mut name = sanitize_component(&request.name);
        let is_png = Path::new(&name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(EXTENSION));
        if !is_png {
            name.push('.');
            name.push_str(EXTENSION);
        }

        self.output_root
            .join(sanitize_component(&request.class_name))
            .join(sanitize_component(&request.method_name))
            .join(name)
    }

    /// Make `frame` upright and opaque, then store it for `request`.
    pub fn process(&mut self, frame: CapturedFrame, request: &ScreenshotRequest) -> Result<PathBuf> {
        let rotation = Rotation::for_frame(request.orientation, frame.width, frame.height);
        debug!(
            "Processing {}x{} frame for {} ({}, {rotation:?})",
            frame.width, frame.height, request.name, request.orientation
        );

        let image = rotation.apply(frame.into_rgba().map_err(AgentError::Capture)?);
        let path = self.output_path(request);
        let components = [&request.class_name, &request.method_name, &request.name];
        if !components.iter().all(|c| is_safe_component(c)) {
            warn!("Unsafe names in request, storing under {}", path.display());
        }

        self.persistence
            .write(&path, &image)
            .map_err(|source| AgentError::Persistence {
                path: path.clone(),
                source,
            })?;

        info!("Saved screenshot {}", path.display());
        self.screenshots
            .entry(TestIdentifier::from(request))
            .or_default()
            .push(path.clone());
        Ok(path)
    }

    /// Files written so far, per test
    pub fn screenshots(&self) -> &BTreeMap<TestIdentifier, Vec<PathBuf>> {
        &self.screenshots
    }
}
