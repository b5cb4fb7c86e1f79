#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod capture;
pub mod landmarker;
#[cfg(feature = "camera-nokhwa")]
pub mod rgba_converter;

// Re-exports for convenience
#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraDevice, CameraStream, NokhwaCameraProvider, available_cameras};
pub use capture::{CaptureProvider, CaptureSource, frame_from_image, load_still_image};
#[cfg(feature = "landmarker-ort")]
pub use landmarker::OrtLandmarkerFactory;
pub use landmarker::{HandLandmarker, LandmarkerFactory, ModelSession};
