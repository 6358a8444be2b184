use anyhow::{Context, bail};
use clap::Parser;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

static EXPECTED_STDOUT_FILE: &str = "expected-stdout";
static EXPECTED_SERIES_FILE: &str = "expected-series";
static OUTPUT_ROOT: &str = "target/golden-tests";

#[derive(Parser, Debug)]
struct Opt {
    /// Write the actual output as the expectation of every test that has none yet
    #[arg(long)]
    bless: bool,
}

struct TestCase {
    dir: PathBuf,
    name: String,
    args: String,
    expected_stdout: Option<String>,
    expected_series: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let mut test_cases = Vec::new();
    let test_dirs =
        std::fs::read_dir("golden-tests/tests").context("golden tests root directory not found")?;
    for entry in test_dirs {
        let entry = entry?;
        let path = entry.path();

        if !path.is_dir() {
            println!(
                "skipping path `{}` because it's not a directory",
                path.display()
            );
            continue;
        }

        let args_path = path.join("args");
        let args = std::fs::read_to_string(&args_path)
            .with_context(|| format!("no `args` file found at `{}`", args_path.display()))?;

        test_cases.push(TestCase {
            name: entry.file_name().to_string_lossy().to_string(),
            expected_stdout: read_optional(&path.join(EXPECTED_STDOUT_FILE))?,
            expected_series: read_optional(&path.join(EXPECTED_SERIES_FILE))?,
            dir: path,
            args,
        })
    }
    test_cases.sort_by(|a, b| a.name.cmp(&b.name));

    let mut errored = false;
    for test_case in test_cases {
        let name = test_case.name.clone();
        if let Err(e) = run_cc_testbed(test_case, opt.bless) {
            println!("Error running golden test `{name}`");
            match e {
                TestError::Internal(e) => println!("{e:?}"),
                TestError::MissingExpectation(path) => println!(
                    "No expectation found at `{}` (rerun with `--bless` to record it)",
                    path.display()
                ),
                TestError::Compare(e) => {
                    if let Some(diff) = e.series_diff {
                        println!("Expected series differ from actual series:\n{diff}\n");
                    }

                    if let Some(diff) = e.stdout_diff {
                        println!("Expected stdout differs from actual stdout:\n{diff}");
                    }
                }
            }
            errored = true;
        } else {
            println!("{name}: ✅");
        }
    }

    if errored {
        bail!("one or more golden tests failed");
    }

    Ok(())
}

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    Ok(Some(contents))
}

enum TestError {
    Internal(anyhow::Error),
    MissingExpectation(PathBuf),
    Compare(CompareError),
}

struct CompareError {
    stdout_diff: Option<String>,
    series_diff: Option<String>,
}

fn run_cc_testbed(test_case: TestCase, bless: bool) -> Result<(), TestError> {
    let output_dir = Path::new(OUTPUT_ROOT).join(&test_case.name);
    if output_dir.exists() {
        std::fs::remove_dir_all(&output_dir)
            .context("failed to clean up previous output")
            .map_err(TestError::Internal)?;
    }

    let command = Command::new("cargo")
        .arg("run")
        .arg("--release")
        .arg("--bin")
        .arg("cc-testbed")
        .arg("--")
        .arg("--output-dir")
        .arg(&output_dir)
        .args(test_case.args.split_whitespace())
        .output()
        .context("cc-testbed process crashed")
        .map_err(TestError::Internal)?;

    if !command.status.success() {
        return Err(TestError::Internal(anyhow::anyhow!(
            "cc-testbed exited with {}:\n{}",
            command.status,
            String::from_utf8_lossy(&command.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&command.stdout);
    let series = collect_series(&output_dir).map_err(TestError::Internal)?;

    let stdout_diff = compare_or_bless(
        &test_case.dir.join(EXPECTED_STDOUT_FILE),
        test_case.expected_stdout,
        &stdout,
        bless,
    )?;
    let series_diff = compare_or_bless(
        &test_case.dir.join(EXPECTED_SERIES_FILE),
        test_case.expected_series,
        &series,
        bless,
    )?;

    if stdout_diff.is_some() || series_diff.is_some() {
        Err(TestError::Compare(CompareError {
            stdout_diff,
            series_diff,
        }))
    } else {
        Ok(())
    }
}

/// Concatenates every CSV series of the output directory, sorted by file name
fn collect_series(output_dir: &Path) -> anyhow::Result<String> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("output directory `{}` not found", output_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "csv") {
            files.push(path);
        }
    }
    files.sort();

    let mut series = String::new();
    for path in files {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read `{}`", path.display()))?;
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        _ = writeln!(series, "=== {name} ===");
        series.push_str(&contents);
    }

    Ok(series)
}

/// Returns a diff if the actual output differs, or persists it when blessing a test that has no
/// expectation yet
fn compare_or_bless(
    path: &Path,
    expected: Option<String>,
    actual: &str,
    bless: bool,
) -> Result<Option<String>, TestError> {
    match expected {
        Some(expected) if expected != actual => Ok(Some(diff::diff_to_string(&expected, actual))),
        Some(_) => Ok(None),
        None if !bless => Err(TestError::MissingExpectation(path.to_path_buf())),
        None => {
            std::fs::write(path, actual.as_bytes())
                .with_context(|| format!("failed to persist `{}`", path.display()))
                .map_err(TestError::Internal)?;
            Ok(None)
        }
    }
}


mod diff {
    use console::{Style, style};
    use similar::{ChangeTag, TextDiff};
    use std::fmt::{self, Write};

    struct Line(Option<usize>);

    impl fmt::Display for Line {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            match self.0 {
                None => write!(f, "    "),
                Some(idx) => write!(f, "{:<4}", idx + 1),
            }
        }
    }

    pub fn diff_to_string(old: &str, new: &str) -> String {
        let mut output = String::new();
        let diff = TextDiff::from_lines(old, new);

        for (idx, group) in diff.grouped_ops(3).iter().enumerate() {
            if idx > 0 {
                _ = writeln!(output, "{:-^1$}", "-", 80);
            }
            for op in group {
                for change in diff.iter_inline_changes(op) {
                    let (sign, s) = match change.tag() {
                        ChangeTag::Delete => ("-", Style::new().red()),
                        ChangeTag::Insert => ("+", Style::new().green()),
                        ChangeTag::Equal => (" ", Style::new().dim()),
                    };
                    _ = write!(
                        output,
                        "{}{} |{}",
                        style(Line(change.old_index())).dim(),
                        style(Line(change.new_index())).dim(),
                        s.apply_to(sign).bold(),
                    );
                    for (emphasized, value) in change.iter_strings_lossy() {
                        if emphasized {
                            _ = write!(output, "{}", s.apply_to(value).underlined().on_black());
                        } else {
                            _ = write!(output, "{}", s.apply_to(value));
                        }
                    }
                    if change.missing_newline() {
                        _ = writeln!(output);
                    }
                }
            }
        }

        output
    }
}
