//! XPS package support: reading source packages, rasterizing their pages
//! and writing the output package.

mod markup;
mod model;
mod package;
mod raster;
mod reader;
mod writer;

pub use model::{
    Brush, FillRule, FixedPage, Geometry, GeometryFigure, ImageBrush, PageContent, PageResource,
    ResourceKind, SolidColor, XpsPath,
};
pub use package::{
    ContentTypes, NS_OXPS, NS_XPS, PartUri, Relationship, Relationships, content_types,
    relationship_types,
};
pub use raster::{PageRasterizer, RasterOptions, RenderingMode};
pub use reader::{XpsPackage, XpsPageRef};
pub use writer::XpsPackageWriter;

#[cfg(test)]
pub(crate) use reader::tests::build_xps;
