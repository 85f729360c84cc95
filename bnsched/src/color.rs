use std::cell::Cell;

thread_local! {
    static COLOR_MODE: Cell<ColorMode> = const { Cell::new(ColorMode::Auto) };
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ColorMode {
    Never,
    #[default]
    Auto,
    Always,
}

pub fn set_color_mode(color: ColorMode) {
    COLOR_MODE.with(|c| c.set(color));
}

pub fn color_mode() -> ColorMode {
    COLOR_MODE.with(Cell::get)
}

/// Whether output to stdout should be colored.
pub fn do_color() -> bool {
    resolve(color_mode(), atty::Stream::Stdout)
}

/// Whether diagnostics written to stderr, such as the compiler's, should be colored.
pub fn do_color_stderr() -> bool {
    resolve(color_mode(), atty::Stream::Stderr)
}

fn resolve(mode: ColorMode, stream: atty::Stream) -> bool {
    match mode {
        ColorMode::Never => false,
        ColorMode::Always => true,
        ColorMode::Auto => atty::is(stream),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_modes_ignore_the_terminal() {
        set_color_mode(ColorMode::Always);
        assert!(do_color());
        assert!(do_color_stderr());
        set_color_mode(ColorMode::Never);
        assert!(!do_color());
        set_color_mode(ColorMode::default());
        assert_eq!(color_mode(), ColorMode::Auto);
    }
}
