use std::ops::Range;

use ariadne::{ColorGenerator, Label, Report, ReportKind, Source};
use itertools::Itertools;

/// A dynamic error type that can hold specific error messages and the
/// instruction(s) the error is attributed to.
pub trait ReportableError: std::error::Error {
    /// message is used for reporting verbose message for `ariadne`.
    fn get_message(&self) -> String {
        self.to_string()
    }
    /// Labels point at instruction indices of the program listing. One error may
    /// carry several labels, e.g. a write and the variable declaration it
    /// refers to.
    fn get_labels(&self) -> Vec<(usize, String)>;
}

/// ReportableError implements `PartialEq` mostly for testing purpose.
impl PartialEq for dyn ReportableError + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.get_labels() == other.get_labels()
    }
}

/// Byte range of the `index`-th line of `listing`. Falls back to the end of
/// the listing when it has fewer lines.
fn line_span(listing: &str, index: usize) -> Range<usize> {
    let mut start = 0;
    for (i, line) in listing.split_inclusive('\n').enumerate() {
        if i == index {
            return start..start + line.trim_end().len();
        }
        start += line.len();
    }
    listing.len()..listing.len()
}

/// Print errors to stderr, annotating the lines of an instruction listing
/// (as produced by the `Display` impl of
/// [`StreamVm`](crate::compiler::StreamVm)).
pub fn report(listing: &str, errs: &[Box<dyn ReportableError + '_>]) {
    let mut colors = ColorGenerator::new();
    for e in errs {
        let rawlabels = e.get_labels();
        let head = rawlabels
            .first()
            .map(|(idx, _)| line_span(listing, *idx))
            .unwrap_or(0..0);
        let labels = rawlabels.iter().map(|(idx, message)| {
            Label::new(line_span(listing, *idx))
                .with_message(message)
                .with_color(colors.next())
        });
        let res = Report::build(ReportKind::Error, head)
            .with_message(e.get_message())
            .with_labels(labels)
            .finish()
            .eprint(Source::from(listing));
        if let Err(err) = res {
            log::error!("failed to print the error report: {err}");
        }
    }
}

/// Messages of `errs`, one per line.
pub fn dump_to_string(errs: &[Box<dyn ReportableError + '_>]) -> String {
    errs.iter().map(|e| e.get_message()).join("\n")
}
