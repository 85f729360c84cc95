use std::fmt;
use std::io;

const INDENT_SIZE: usize = 2;

/// Wraps an [io::Write] for use as a [fmt::Write].
pub struct ToWriteFmt<T: io::Write>(pub T);

/// Wraps a [fmt::Write], prefixing each line written with a fixed string.
pub struct LinePrefixWrite<'a, W: fmt::Write> {
    inner: W,
    prefix: &'a str,
    at_line_start: bool,
}

impl<T: io::Write> fmt::Write for ToWriteFmt<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl<'a, W: fmt::Write> LinePrefixWrite<'a, W> {
    pub fn new(inner: W, prefix: &'a str) -> Self {
        LinePrefixWrite {
            inner,
            prefix,
            at_line_start: true,
        }
    }
}

impl<W: fmt::Write> fmt::Write for LinePrefixWrite<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for line in s.split_inclusive('\n') {
            if self.at_line_start {
                self.inner.write_str(self.prefix)?;
            }
            self.inner.write_str(line)?;
            self.at_line_start = line.ends_with('\n');
        }
        Ok(())
    }
}

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}
