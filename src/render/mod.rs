mod cache;
mod gate;
mod surface;

pub use cache::{CacheCounters, PageBitmapCache, PageBitmapKey};
pub use gate::{GateClaim, PageWorkGate, PageWorkGuard};
pub(crate) use surface::{frame_from_pixmap, pixmap_from_frame, pixmap_from_rgba};
pub use surface::{RasterDevice, RenderDevice, Surface, SurfaceLease, SurfaceManager};
