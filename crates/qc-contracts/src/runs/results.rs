use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDateTime;

pub const RESULT_FILE_PREFIX: &str = "analysis_result_";

pub fn result_file_name(at: NaiveDateTime) -> String {
    format!("{RESULT_FILE_PREFIX}{}.txt", at.format("%Y%m%d_%H%M%S"))
}

/// Writes the text verbatim. Two saves within the same second share a name; the later one wins.
pub fn save_result(dir: &Path, text: &str, at: NaiveDateTime) -> anyhow::Result<PathBuf> {
    let path = dir.join(result_file_name(at));
    std::fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{result_file_name, save_result};

    fn at(second: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 4)
            .and_then(|date| date.and_hms_opt(5, 6, second))
            .unwrap_or_default()
    }

    #[test]
    fn file_name_embeds_second_granularity_timestamp() {
        assert_eq!(result_file_name(at(7)), "analysis_result_20260304_050607.txt");
    }

    #[test]
    fn save_writes_text_verbatim() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let text = "  The box has a dented corner.\n\n**Verdict:** damaged  ";
        let path = save_result(temp.path(), text, at(7))?;
        assert_eq!(std::fs::read_to_string(path)?, text);
        Ok(())
    }

    #[test]
    fn same_second_saves_collide_and_last_write_wins() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = save_result(temp.path(), "first", at(9))?;
        let second = save_result(temp.path(), "second", at(9))?;
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(second)?, "second");
        assert_eq!(std::fs::read_dir(temp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn save_into_missing_directory_reports_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("nope");
        let err = save_result(&missing, "x", at(1)).unwrap_err();
        assert!(format!("{err:#}").contains("analysis_result_20260304_050601.txt"));
        Ok(())
    }
}
