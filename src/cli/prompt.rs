//! Line-oriented prompts over any reader/writer pair.
//!
//! The binary wires this to stdin/stderr; tests drive it with `Cursor`.

use std::io::{self, BufRead, Write};

/// Answer to a numbered menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Item(usize),
    All,
    Cancel,
}

pub struct Prompter<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Yes/no question. Empty input or end of input picks `default`.
    pub fn confirm(&mut self, message: &str, default: bool) -> io::Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        write!(self.writer, "{message} {hint}: ")?;
        self.writer.flush()?;

        let Some(input) = self.read_line()? else {
            writeln!(self.writer)?;
            return Ok(default);
        };
        Ok(match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => true,
            "n" | "no" => false,
            _ => default,
        })
    }

    /// Number with a default; re-asks until the input parses.
    pub fn ask_f64(&mut self, message: &str, default: f64) -> io::Result<f64> {
        loop {
            write!(self.writer, "{message} [{default}]: ")?;
            self.writer.flush()?;

            let Some(input) = self.read_line()? else {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input closed before a number was given",
                ));
            };
            let input = input.trim();
            if input.is_empty() {
                return Ok(default);
            }
            match input.parse::<f64>() {
                Ok(value) => return Ok(value),
                Err(_) => writeln!(self.writer, "  not a number: {input}")?,
            }
        }
    }

    /// Numbered menu, 1-based. `0`, `q` or empty input cancels; `a` picks
    /// every item when `allow_all` is set.
    pub fn choose(&mut self, title: &str, items: &[String], allow_all: bool) -> io::Result<Choice> {
        writeln!(self.writer, "{title}")?;
        for (i, item) in items.iter().enumerate() {
            writeln!(self.writer, "  {:>2}) {item}", i + 1)?;
        }
        if allow_all {
            writeln!(self.writer, "   a) all of the above")?;
        }

        loop {
            write!(self.writer, "Choice (0 to cancel): ")?;
            self.writer.flush()?;
            let Some(input) = self.read_line()? else {
                return Ok(Choice::Cancel);
            };
            let input = input.trim().to_ascii_lowercase();
            match input.as_str() {
                "" | "0" | "q" => return Ok(Choice::Cancel),
                "a" | "all" if allow_all => return Ok(Choice::All),
                _ => {}
            }
            match input.parse::<usize>() {
                Ok(n) if (1..=items.len()).contains(&n) => return Ok(Choice::Item(n - 1)),
                _ => writeln!(self.writer, "  pick 1-{}", items.len())?,
            }
        }
    }

    /// Several picks from a numbered list: `1,3 4`, `all`, or empty for none.
    /// Out-of-range numbers are ignored. Indices come back sorted, 0-based.
    pub fn choose_many(&mut self, title: &str, items: &[String]) -> io::Result<Vec<usize>> {
        writeln!(self.writer, "{title}")?;
        for (i, item) in items.iter().enumerate() {
            writeln!(self.writer, "  {:>2}) {item}", i + 1)?;
        }
        write!(self.writer, "Numbers separated by commas, 'all', or Enter for none: ")?;
        self.writer.flush()?;

        let Some(input) = self.read_line()? else {
            return Ok(Vec::new());
        };
        let input = input.trim();
        if input.eq_ignore_ascii_case("all") {
            return Ok((0..items.len()).collect());
        }
        let mut picks: Vec<usize> = input
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter_map(|tok| tok.trim().parse::<usize>().ok())
            .filter(|n| (1..=items.len()).contains(n))
            .map(|n| n - 1)
            .collect();
        picks.sort_unstable();
        picks.dedup();
        Ok(picks)
    }

    /// Wait for the user to finish a step by hand. Returns `false` when they
    /// type `skip` or input ends.
    pub fn wait_for_step(&mut self, message: &str) -> io::Result<bool> {
        write!(self.writer, "{message} (Enter when done, 'skip' to leave it): ")?;
        self.writer.flush()?;
        let Some(input) = self.read_line()? else {
            writeln!(self.writer)?;
            return Ok(false);
        };
        Ok(!input.trim().eq_ignore_ascii_case("skip"))
    }

    /// Write a line to the prompt stream.
    pub fn say(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}")
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(
            line.trim_end_matches('\n').trim_end_matches('\r').to_string(),
        ))
    }
}
