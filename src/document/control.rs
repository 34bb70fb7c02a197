//! Command-list print control.
//!
//! A [`DeviceContext`] records drawing commands into a [`CommandList`];
//! a [`PrintControl`] plays each closed list into one package page.
//! Vector content stays vector; bitmaps carry images and pages the
//! backend cannot record.

use tracing::{debug, trace};

use crate::backend::{DocumentBackend, PageOp, PageRect, PageSize, RgbaFrame};
use crate::error::{PrintError, PrintResult};
use crate::target::PackageWriter;
use crate::xps::{
    Brush, FillRule, FixedPage, Geometry, GeometryFigure, ImageBrush, PageResource, PartUri,
    SolidColor, XpsPath,
};

use super::format::PdfOptions;
use super::session::ProductionContext;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Clear(SolidColor),
    FillPath {
        figures: Vec<GeometryFigure>,
        color: SolidColor,
        fill_rule: FillRule,
    },
    PushClip {
        figures: Vec<GeometryFigure>,
        fill_rule: FillRule,
    },
    PopClip,
    DrawBitmap {
        frame: RgbaFrame,
        dest: PageRect,
    },
}

/// Recorded drawing commands for one page.
#[derive(Debug, Default)]
pub struct CommandList {
    commands: Vec<DrawCommand>,
    closed: bool,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Seals the list; closed lists accept no more commands.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Default)]
pub struct DeviceContext {
    target: Option<CommandList>,
    drawing: bool,
    clip_depth: usize,
}

impl DeviceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_target(&mut self, list: CommandList) -> PrintResult<()> {
        if self.drawing {
            return Err(PrintError::invalid_argument(
                "cannot change the target while drawing",
            ));
        }
        if list.is_closed() {
            return Err(PrintError::invalid_argument("command list is already closed"));
        }
        self.target = Some(list);
        Ok(())
    }

    pub fn begin_draw(&mut self) -> PrintResult<()> {
        if self.target.is_none() {
            return Err(PrintError::invalid_argument("begin_draw without a target"));
        }
        self.drawing = true;
        Ok(())
    }

    pub fn clear(&mut self, color: SolidColor) -> PrintResult<()> {
        self.record(DrawCommand::Clear(color))
    }

    pub fn fill_path(
        &mut self,
        figures: Vec<GeometryFigure>,
        color: SolidColor,
        fill_rule: FillRule,
    ) -> PrintResult<()> {
        self.record(DrawCommand::FillPath {
            figures,
            color,
            fill_rule,
        })
    }

    pub fn push_clip(&mut self, figures: Vec<GeometryFigure>, fill_rule: FillRule) -> PrintResult<()> {
        self.record(DrawCommand::PushClip { figures, fill_rule })?;
        self.clip_depth += 1;
        Ok(())
    }

    pub fn pop_clip(&mut self) -> PrintResult<()> {
        if self.clip_depth == 0 {
            return Err(PrintError::invalid_argument("pop_clip without a pushed clip"));
        }
        self.record(DrawCommand::PopClip)?;
        self.clip_depth -= 1;
        Ok(())
    }

    pub fn draw_bitmap(&mut self, frame: RgbaFrame, dest: PageRect) -> PrintResult<()> {
        self.record(DrawCommand::DrawBitmap { frame, dest })
    }

    /// Records one operation of a backend page recording.
    pub fn play(&mut self, op: PageOp) -> PrintResult<()> {
        match op {
            PageOp::Fill {
                figures,
                color,
                fill_rule,
            } => self.fill_path(figures, color, fill_rule),
            PageOp::PushClip { figures, fill_rule } => self.push_clip(figures, fill_rule),
            PageOp::PopClip => self.pop_clip(),
            PageOp::Image { frame, dest } => self.draw_bitmap(frame, dest),
        }
    }

    /// Ends drawing and hands back the recorded list. Clips still open are
    /// closed.
    pub fn end_draw(&mut self) -> PrintResult<CommandList> {
        if !self.drawing {
            return Err(PrintError::invalid_argument("end_draw without begin_draw"));
        }
        while self.clip_depth > 0 {
            self.pop_clip()?;
        }
        self.drawing = false;
        self.target
            .take()
            .ok_or_else(|| PrintError::invalid_argument("end_draw without a target"))
    }

    fn record(&mut self, command: DrawCommand) -> PrintResult<()> {
        match (&mut self.target, self.drawing) {
            (Some(list), true) => {
                list.commands.push(command);
                Ok(())
            }
            _ => Err(PrintError::invalid_argument("draw call outside begin_draw/end_draw")),
        }
    }
}

/// Turns closed command lists into package pages.
pub struct PrintControl {
    writer: Box<dyn PackageWriter>,
    raster_dpi: f32,
    pages: usize,
    closed: bool,
}

impl PrintControl {
    /// Starts document `name` on `writer`.
    pub fn new(mut writer: Box<dyn PackageWriter>, name: &PartUri, raster_dpi: f32) -> PrintResult<Self> {
        if !raster_dpi.is_finite() || raster_dpi <= 0.0 {
            return Err(PrintError::invalid_argument("raster dpi must be positive"));
        }
        writer.start_new_document(name)?;
        Ok(Self {
            writer,
            raster_dpi,
            pages: 0,
            closed: false,
        })
    }

    pub fn raster_dpi(&self) -> f32 {
        self.raster_dpi
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn add_page(&mut self, commands: &CommandList, page_size: PageSize) -> PrintResult<()> {
        if self.closed {
            return Err(PrintError::package("print control is closed"));
        }
        if !commands.is_closed() {
            return Err(PrintError::invalid_argument(
                "command list must be closed before it is added",
            ));
        }

        let index = self.pages;
        let mut page = FixedPage::new(PartUri::from_root(&format!("page{index}"))?, page_size);
        let mut clips: Vec<Geometry> = Vec::new();
        for (position, command) in commands.commands().iter().enumerate() {
            let (geometry, brush) = match command {
                DrawCommand::Clear(color) => (
                    Geometry::new(
                        format!("clear{index}_{position}"),
                        vec![GeometryFigure::rectangle(PageRect::from_size(page_size))],
                    ),
                    Brush::Solid(*color),
                ),
                DrawCommand::FillPath {
                    figures,
                    color,
                    fill_rule,
                } => (
                    Geometry::new(format!("fill{index}_{position}"), figures.clone())
                        .with_fill_rule(*fill_rule),
                    Brush::Solid(*color),
                ),
                DrawCommand::PushClip { figures, fill_rule } => {
                    clips.push(
                        Geometry::new(format!("clip{index}_{position}"), figures.clone())
                            .with_fill_rule(*fill_rule),
                    );
                    continue;
                }
                DrawCommand::PopClip => {
                    clips.pop();
                    continue;
                }
                DrawCommand::DrawBitmap { frame, dest } => {
                    let image = PartUri::from_root(&format!("image{index}_{position}"))?;
                    page.resources.push(PageResource::png(image.clone(), frame.encode_png()?));
                    (
                        Geometry::new(
                            format!("bitmap{index}_{position}"),
                            vec![GeometryFigure::rectangle(*dest)],
                        ),
                        Brush::Image(ImageBrush {
                            image,
                            viewbox: PageRect::new(0.0, 0.0, frame.width as f32, frame.height as f32),
                            viewport: *dest,
                        }),
                    )
                }
            };
            let mut path = XpsPath::filled(geometry, brush);
            path.clips = clips.clone();
            page.add_path(path);
        }

        trace!(index, commands = commands.commands().len(), "print control page");
        self.writer.add_page(page)?;
        self.pages += 1;
        Ok(())
    }

    pub fn close(&mut self) -> PrintResult<()> {
        if self.closed {
            return Ok(());
        }
        self.writer.close()?;
        self.closed = true;
        debug!(pages = self.pages, "print control closed");
        Ok(())
    }
}

/// Records every page of `backend` through a print control and closes it.
pub fn print_with_control(
    backend: &dyn DocumentBackend,
    options: &PdfOptions,
    writer: Box<dyn PackageWriter>,
    context: &ProductionContext<'_>,
) -> PrintResult<usize> {
    context.check_canceled()?;
    let mut control = PrintControl::new(writer, context.document_name(), options.raster_dpi)?;
    let mut device = DeviceContext::new();
    let background = options.effective_background();

    for index in 0..backend.page_count() {
        context.check_canceled()?;
        let size = backend.page_size(index)?;

        device.set_target(CommandList::new())?;
        device.begin_draw()?;
        device.clear(background)?;
        match backend.record_page(index)? {
            Some(ops) => {
                trace!(index, ops = ops.len(), "recorded vector page");
                for op in ops {
                    device.play(op)?;
                }
            }
            None => {
                let frame = backend.render_page_at_dpi(index, control.raster_dpi())?;
                device.draw_bitmap(frame, PageRect::from_size(size))?;
            }
        }
        let mut commands = device.end_draw()?;
        commands.close();

        control.add_page(&commands, size)?;
    }

    control.close()?;
    Ok(control.pages())
}
