//! Plain-text tables for command output.

use std::time::Duration;

use crate::api::{Brand, Headphone, HeadphoneType};
use crate::cache::{CacheSource, EntrySummary, Validity};
use crate::commands::CommandInfo;

/// A record that can be shown as one table row.
pub trait Row {
  fn headers() -> &'static [&'static str];
  fn cells(&self) -> Vec<String>;
}

impl Row for Brand {
  fn headers() -> &'static [&'static str] {
    &["ID", "NAME", "SLUG"]
  }

  fn cells(&self) -> Vec<String> {
    vec![self.id.clone(), self.name.clone(), self.slug.clone()]
  }
}

impl Row for HeadphoneType {
  fn headers() -> &'static [&'static str] {
    &["ID", "NAME", "SLUG"]
  }

  fn cells(&self) -> Vec<String> {
    vec![self.id.clone(), self.name.clone(), self.slug.clone()]
  }
}

impl Row for Headphone {
  fn headers() -> &'static [&'static str] {
    &["ID", "NAME", "PRICE", "BRAND", "TYPE"]
  }

  fn cells(&self) -> Vec<String> {
    // Older records may carry only the ids
    let or_id = |name: &str, id: &str| {
      if name.is_empty() {
        id.to_string()
      } else {
        name.to_string()
      }
    };
    vec![
      self.id.clone(),
      self.name.clone(),
      format!("{:.2}", self.price),
      or_id(&self.brand.name, &self.brand_id),
      or_id(&self.kind.name, &self.type_id),
    ]
  }
}

/// Case-insensitive substring match, the way the dashboard search box filters.
pub fn matches_filter(name: &str, filter: Option<&str>) -> bool {
  match filter.map(str::trim) {
    Some(f) if !f.is_empty() => name.to_lowercase().contains(&f.to_lowercase()),
    _ => true,
  }
}

pub fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "from server",
    CacheSource::CacheFresh => "cached",
    CacheSource::CacheStale => "cached, revalidating",
  }
}

pub fn records<R: Row>(rows: &[&R]) -> String {
  let cells: Vec<Vec<String>> = rows.iter().map(|r| r.cells()).collect();
  table(R::headers(), &cells)
}

pub fn summary(entries: &[EntrySummary]) -> String {
  let cells: Vec<Vec<String>> = entries
    .iter()
    .map(|e| {
      vec![
        e.key.to_string(),
        format!("{:?}", e.status).to_lowercase(),
        match e.validity {
          Validity::Valid => "valid".to_string(),
          Validity::Invalidated => "invalidated".to_string(),
        },
        e.subscribers.to_string(),
        e.failure_count.to_string(),
        e.age.map(format_age).unwrap_or_else(|| "-".to_string()),
      ]
    })
    .collect();
  table(
    &["KEY", "STATUS", "VALIDITY", "OBSERVERS", "FAILURES", "AGE"],
    &cells,
  )
}

pub fn help() -> String {
  let cells: Vec<Vec<String>> = crate::commands::COMMANDS
    .iter()
    .map(|cmd: &CommandInfo| {
      vec![
        cmd.name.to_string(),
        cmd.aliases.join(", "),
        cmd.description.to_string(),
      ]
    })
    .collect();
  table(&["COMMAND", "ALIASES", "DESCRIPTION"], &cells)
}

fn format_age(age: Duration) -> String {
  let secs = age.as_secs();
  if secs < 60 {
    format!("{}s", secs)
  } else {
    format!("{}m{:02}s", secs / 60, secs % 60)
  }
}

fn render_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
  let padded: Vec<String> = cells
    .zip(widths)
    .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
    .collect();
  padded.join("  ").trim_end().to_string()
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
  let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
  for row in rows {
    for (width, cell) in widths.iter_mut().zip(row) {
      *width = (*width).max(cell.chars().count());
    }
  }

  let mut out = render_line(headers.iter().copied(), &widths);
  for row in rows {
    out.push('\n');
    out.push_str(&render_line(row.iter().map(String::as_str), &widths));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_filter_is_case_insensitive_substring() {
    assert!(matches_filter("Sennheiser", Some("HEIS")));
    assert!(matches_filter("Sennheiser", None));
    assert!(matches_filter("Sennheiser", Some("  ")));
    assert!(!matches_filter("Sony", Some("bose")));
  }

  #[test]
  fn test_columns_are_aligned() {
    let brands = [
      Brand {
        id: "b1".to_string(),
        name: "Audio-Technica".to_string(),
        slug: "audio-technica".to_string(),
      },
      Brand {
        id: "b22".to_string(),
        name: "AKG".to_string(),
        slug: "akg".to_string(),
      },
    ];
    let rows: Vec<&Brand> = brands.iter().collect();
    let out = records(&rows);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "ID   NAME            SLUG");
    assert_eq!(lines[1], "b1   Audio-Technica  audio-technica");
    assert_eq!(lines[2], "b22  AKG             akg");
  }

  #[test]
  fn test_headphone_falls_back_to_ids() {
    let headphone = Headphone {
      id: "h1".to_string(),
      name: "HD 600".to_string(),
      slug: "hd-600".to_string(),
      price: 299.0,
      brand: Brand::default(),
      kind: HeadphoneType::default(),
      brand_id: "b2".to_string(),
      type_id: "t1".to_string(),
    };
    assert_eq!(headphone.cells(), vec!["h1", "HD 600", "299.00", "b2", "t1"]);
  }

  #[test]
  fn test_format_age() {
    assert_eq!(format_age(Duration::from_secs(42)), "42s");
    assert_eq!(format_age(Duration::from_secs(305)), "5m05s");
  }
}
