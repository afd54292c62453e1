// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame capture backends
//!
//! A backend hands back one raw frame per call. Post-processing (alpha,
//! rotation, encoding) happens later in the processor, so backends only
//! report the layout of the bytes they produced.

use std::io;
use std::path::PathBuf;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Byte order of a 32-bit pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// B, G, R, A (X11 Z-pixmaps on little-endian hosts)
    Bgra32,
    /// R, G, B, A
    Rgba32,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// Captured frame data
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Pixel bytes, row-major, no padding
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
}

impl CapturedFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
    }

    fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.bytes_per_pixel())
    }

    /// Convert to an RGBA image with every pixel fully opaque.
    pub fn into_rgba(self) -> io::Result<RgbaImage> {
        let expected = self.expected_len().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Frame dimensions overflow")
        })?;
        if expected == 0 || self.data.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame {}x{} needs {expected} bytes, got {}",
                    self.width,
                    self.height,
                    self.data.len()
                ),
            ));
        }

        let (width, height, format) = (self.width, self.height, self.format);
        let mut data = self.data;
        for pixel in data.chunks_exact_mut(4) {
            if format == PixelFormat::Bgra32 {
                pixel.swap(0, 2);
            }
            pixel[3] = 0xff;
        }

        RgbaImage::from_raw(width, height, data).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Frame buffer too small")
        })
    }
}

/// Frame capture trait
pub trait FrameCapture: Send {
    /// Capture a frame
    fn capture_frame(&mut self) -> io::Result<CapturedFrame>;

    /// Get current frame dimensions
    fn dimensions(&self) -> (u32, u32);
}

impl<T: FrameCapture + ?Sized> FrameCapture for Box<T> {
    fn capture_frame(&mut self) -> io::Result<CapturedFrame> {
        (**self).capture_frame()
    }

    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }
}

/// Which backend to capture from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureSource {
    /// Root window of the X display named by `$DISPLAY`
    X11,
    /// Generated test pattern
    Stub { width: u32, height: u32 },
    /// Replay a PNG from disk
    File(PathBuf),
}

impl CaptureSource {
    /// Test pattern in a portrait phone resolution
    pub fn default_stub() -> Self {
        CaptureSource::Stub {
            width: stub::DEFAULT_WIDTH,
            height: stub::DEFAULT_HEIGHT,
        }
    }
}

impl Default for CaptureSource {
    fn default() -> Self {
        if cfg!(all(target_os = "linux", feature = "x11")) {
            CaptureSource::X11
        } else {
            CaptureSource::default_stub()
        }
    }
}

/// Open the backend described by `source`.
pub fn open(source: &CaptureSource) -> io::Result<Box<dyn FrameCapture>> {
    match source {
        #[cfg(all(target_os = "linux", feature = "x11"))]
        CaptureSource::X11 => Ok(Box::new(x11::X11Capture::new()?)),
        #[cfg(not(all(target_os = "linux", feature = "x11")))]
        CaptureSource::X11 => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "X11 capture is not available in this build",
        )),
        CaptureSource::Stub { width, height } => Ok(Box::new(stub::StubCapture::new(*width, *height))),
        CaptureSource::File(path) => Ok(Box::new(file::FileCapture::new(path.clone())?)),
    }
}

/// X11 frame capture implementation
#[cfg(all(target_os = "linux", feature = "x11"))]
pub mod x11 {
    use super::*;
    use x11rb::connection::Connection;
    use x11rb::protocol::xproto::*;
    use x11rb::rust_connection::RustConnection;

    /// Grabs the root window with `GetImage`
    pub struct X11Capture {
        /// Display connection
        display: RustConnection,
        /// Screen root window
        root: Window,
        /// Size of the last capture
        width: u32,
        height: u32,
    }

    impl X11Capture {
        /// Connect to the display named by `$DISPLAY`
        pub fn new() -> io::Result<Self> {
            let (display, screen_num) = x11rb::connect(None).map_err(io::Error::other)?;

            let screen = display.setup().roots.get(screen_num).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Screen not found")
            })?;
            let root = screen.root;
            let (width, height) = (
                u32::from(screen.width_in_pixels),
                u32::from(screen.height_in_pixels),
            );
            log::info!("X11 capture on screen {screen_num} ({width}x{height})");

            Ok(Self {
                display,
                root,
                width,
                height,
            })
        }

        /// Current root window size; follows resolution and rotation changes
        fn root_geometry(&self) -> io::Result<(u16, u16)> {
            let geometry = self
                .display
                .get_geometry(self.root)
                .map_err(io::Error::other)?
                .reply()
                .map_err(io::Error::other)?;
            Ok((geometry.width, geometry.height))
        }
    }

    impl FrameCapture for X11Capture {
        fn capture_frame(&mut self) -> io::Result<CapturedFrame> {
            let (width, height) = self.root_geometry()?;

            let reply = self
                .display
                .get_image(ImageFormat::Z_PIXMAP, self.root, 0, 0, width, height, !0)
                .map_err(io::Error::other)?
                .reply()
                .map_err(io::Error::other)?;

            // 24/32-bit visuals come back as 4 bytes per pixel, BGRX
            if reply.depth != 24 && reply.depth != 32 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("Unsupported root depth {}", reply.depth),
                ));
            }

            self.width = u32::from(width);
            self.height = u32::from(height);
            log::debug!("Captured {}x{} from X11", self.width, self.height);

            Ok(CapturedFrame::new(
                reply.data,
                self.width,
                self.height,
                PixelFormat::Bgra32,
            ))
        }

        fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }
    }
}

/// Stub capture for platforms without implementation
pub mod stub {
    use super::*;

    pub const DEFAULT_WIDTH: u32 = 480;
    pub const DEFAULT_HEIGHT: u32 = 800;

    /// Generates a gradient that shifts with every frame
    pub struct StubCapture {
        width: u32,
        height: u32,
        frame_count: u64,
    }

    impl StubCapture {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                frame_count: 0,
            }
        }
    }

    impl FrameCapture for StubCapture {
        fn capture_frame(&mut self) -> io::Result<CapturedFrame> {
            let (width, height) = (self.width as usize, self.height as usize);
            let phase = (self.frame_count % 256) as u8;
            let mut data = Vec::with_capacity(width * height * 4);

            for y in 0..height {
                for x in 0..width {
                    data.extend_from_slice(&[
                        (x as u8).wrapping_add(phase),       // B
                        (y as u8).wrapping_add(phase),       // G
                        ((x + y) as u8).wrapping_add(phase), // R
                        0,                                   // X
                    ]);
                }
            }

            self.frame_count += 1;
            Ok(CapturedFrame::new(
                data,
                self.width,
                self.height,
                PixelFormat::Bgra32,
            ))
        }

        fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }
    }
}

/// Replays a PNG file as the captured frame
pub mod file {
    use super::*;

    #[derive(Debug)]
    pub struct FileCapture {
        path: PathBuf,
        dimensions: (u32, u32),
    }

    impl FileCapture {
        /// Fails if `path` is not a readable image.
        pub fn new(path: PathBuf) -> io::Result<Self> {
            let dimensions = image::image_dimensions(&path).map_err(io::Error::other)?;
            Ok(Self { path, dimensions })
        }
    }

    impl FrameCapture for FileCapture {
        fn capture_frame(&mut self) -> io::Result<CapturedFrame> {
            // Re-read on every capture so the file can be swapped between requests
            let image = image::open(&self.path).map_err(io::Error::other)?.to_rgba8();
            self.dimensions = image.dimensions();
            let (width, height) = self.dimensions;
            Ok(CapturedFrame::new(
                image.into_raw(),
                width,
                height,
                PixelFormat::Rgba32,
            ))
        }

        fn dimensions(&self) -> (u32, u32) {
            self.dimensions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_rgba_swaps_and_forces_alpha() {
        let frame = CapturedFrame::new(vec![1, 2, 3, 0, 4, 5, 6, 7], 2, 1, PixelFormat::Bgra32);
        let image = frame.into_rgba().unwrap();
        assert_eq!(image.as_raw(), &[3, 2, 1, 0xff, 6, 5, 4, 0xff]);

        let frame = CapturedFrame::new(vec![1, 2, 3, 0], 1, 1, PixelFormat::Rgba32);
        assert_eq!(frame.into_rgba().unwrap().as_raw(), &[1, 2, 3, 0xff]);
    }

    #[test]
    fn test_into_rgba_rejects_short_buffer() {
        let frame = CapturedFrame::new(vec![0; 12], 2, 2, PixelFormat::Bgra32);
        let err = frame.into_rgba().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let empty = CapturedFrame::new(Vec::new(), 0, 0, PixelFormat::Rgba32);
        empty.into_rgba().unwrap_err();
    }

    #[test]
    fn test_stub_capture_frame() {
        let mut capture = stub::StubCapture::new(320, 240);
        let frame = capture.capture_frame().unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(frame.data.len(), 320 * 240 * 4);
        assert_eq!(capture.dimensions(), (320, 240));

        // Consecutive frames differ
        let next = capture.capture_frame().unwrap();
        assert_ne!(frame.data, next.data);
    }

    #[test]
    fn test_boxed_capture() {
        let mut capture = open(&CaptureSource::Stub {
            width: 4,
            height: 2,
        })
        .unwrap();
        assert_eq!(capture.capture_frame().unwrap().data.len(), 32);
        assert_eq!(capture.dimensions(), (4, 2));
    }

    #[test]
    fn test_file_capture_replays_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let source = RgbaImage::from_fn(3, 2, |x, y| image::Rgba([x as u8, y as u8, 9, 128]));
        source.save(&path).unwrap();

        let mut capture = file::FileCapture::new(path).unwrap();
        assert_eq!(capture.dimensions(), (3, 2));
        let frame = capture.capture_frame().unwrap();
        assert_eq!(frame.format, PixelFormat::Rgba32);

        let image = frame.into_rgba().unwrap();
        assert_eq!(image.get_pixel(2, 1), &image::Rgba([2, 1, 9, 0xff]));
    }

    #[test]
    fn test_file_capture_missing_file() {
        file::FileCapture::new(PathBuf::from("/nonexistent/frame.png")).unwrap_err();
    }

    #[test]
    fn test_capture_source_serde() {
        let source: CaptureSource = serde_json::from_str(r#"{"file": "replay.png"}"#).unwrap();
        assert_eq!(source, CaptureSource::File(PathBuf::from("replay.png")));

        let source: CaptureSource =
            serde_json::from_str(r#"{"stub": {"width": 800, "height": 480}}"#).unwrap();
        assert_eq!(
            source,
            CaptureSource::Stub {
                width: 800,
                height: 480
            }
        );
        assert_eq!(serde_json::from_str::<CaptureSource>(r#""x11""#).unwrap(), CaptureSource::X11);
    }
}
