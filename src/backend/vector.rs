//! Vector page content in DIPs, recorded from a source page.

use kurbo::{Affine, BezPath, PathEl};

use crate::xps::{FillRule, GeometryFigure, SolidColor};

use super::traits::{PageRect, RgbaFrame};

/// Maximum distance in DIPs between a curve and its flattened polyline.
pub const FLATTEN_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum PageOp {
    Fill {
        figures: Vec<GeometryFigure>,
        color: SolidColor,
        fill_rule: FillRule,
    },
    PushClip {
        figures: Vec<GeometryFigure>,
        fill_rule: FillRule,
    },
    PopClip,
    Image {
        frame: RgbaFrame,
        dest: PageRect,
    },
}

/// Flattens `path` into straight-segment figures after applying `transform`.
pub fn outline_figures(path: &BezPath, transform: Affine) -> Vec<GeometryFigure> {
    let mut figures = Vec::new();
    let mut current: Option<GeometryFigure> = None;

    let transformed = transform * path;
    kurbo::flatten(transformed.iter(), FLATTEN_TOLERANCE, |element| {
        match element {
            PathEl::MoveTo(point) => {
                figures.extend(current.take().filter(|figure| !figure.segments.is_empty()));
                current = Some(GeometryFigure {
                    start: (point.x as f32, point.y as f32),
                    segments: Vec::new(),
                    closed: false,
                    filled: true,
                });
            }
            PathEl::LineTo(point) => {
                if let Some(figure) = current.as_mut() {
                    figure.segments.push((point.x as f32, point.y as f32));
                }
            }
            PathEl::ClosePath => {
                if let Some(figure) = current.as_mut() {
                    figure.closed = true;
                }
            }
            // flatten only emits lines
            PathEl::QuadTo(..) | PathEl::CurveTo(..) => {}
        }
    });
    figures.extend(current.filter(|figure| !figure.segments.is_empty()));
    figures
}
