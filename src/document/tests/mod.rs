mod preview;
mod support;
