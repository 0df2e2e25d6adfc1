pub mod orientation;
pub mod resize;
pub mod transformer;

pub use orientation::ImageOrientation;
pub use resize::ImageResize;
pub use transformer::ImageTransformer;
