//! Deterministic regex extraction, used when no LLM is configured.
//!
//! - Bullet or numbered lines become line items, with a leading or trailing
//!   quantity and unit when present
//! - Without bullets, "<qty> <unit> of <thing>" phrases in the body are used
//! - Categories are the catalog vocabulary terms that occur in subject or body

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;

use super::email::EmailDocument;
use super::{Extraction, Extractor, LineItem, normalize_categories};
use crate::error::ExtractError;

const UNITS: &str = r"pcs|pc|pieces|piece|units|unit|ea|each|sets|set|pairs|pair|boxes|box|rolls|roll|pallets|pallet|kg|tons|tonnes|t|m|meters|metres|ft|feet|l|litres|liters";

const MONTHS: &str = r"jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|jun(?:e)?|jul(?:y)?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

/// Free-mail domains never name the requester's company.
const FREE_MAIL: &[&str] = &["gmail", "googlemail", "outlook", "hotmail", "yahoo", "icloud", "proton", "protonmail", "live", "aol"];

const MAX_SUMMARY_CHARS: usize = 160;

struct Patterns {
    bullet: Regex,
    leading_qty: Regex,
    trailing_qty: Regex,
    inline_qty: Regex,
    delivery: Regex,
    needed_by: Regex,
    company: Regex,
    subject_prefix: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            bullet: Regex::new(r"^\s*(?:[-*•]|\d{1,3}[.)])\s+(?P<text>\S.*)$")?,
            leading_qty: Regex::new(&format!(
                r"(?i)^(?P<qty>\d[\d,]*(?:\.\d+)?)\s*(?:x\s+|×\s*)?(?:(?P<unit>{UNITS})\.?\s+)?(?:x\s+|of\s+)?(?P<desc>.+)$"
            ))?,
            trailing_qty: Regex::new(&format!(
                r"(?i)^(?P<desc>.+?)\s*(?:[-:–]|x|×|qty:?|quantity:?)\s*(?P<qty>\d[\d,]*(?:\.\d+)?)\s*(?P<unit>{UNITS})?\.?$"
            ))?,
            inline_qty: Regex::new(&format!(
                r"(?i)\b(?P<qty>\d[\d,]*(?:\.\d+)?)\s*(?P<unit>{UNITS})\.?\s+(?:of\s+)?"
            ))?,
            delivery: Regex::new(
                r"(?i)\b(?:deliver(?:y|ed)?|ship(?:ping|ped)?)\s+(?:to|at|location)\s*:?\s*(?P<loc>[^.;\n]+)",
            )?,
            needed_by: Regex::new(&format!(
                r"(?i)\b(?:needed by|required by|deliver(?:ed|y)? by|by|before|no later than|deadline:?)\s+(?P<date>\d{{4}}-\d{{2}}-\d{{2}}|\d{{1,2}}/\d{{1,2}}/\d{{2,4}}|\d{{1,2}}(?:st|nd|rd|th)?\s+(?:{MONTHS})\b(?:\s+\d{{4}})?|(?:{MONTHS})\s+\d{{1,2}}(?:st|nd|rd|th)?(?:,?\s+\d{{4}})?)"
            ))?,
            company: Regex::new(r"(?im)^\s*(?:company|organi[sz]ation)\s*:\s*(?P<name>.+?)\s*$")?,
            subject_prefix: Regex::new(r"(?i)^(?:(?:re|fw|fwd|rfq|rfp|quote request)\s*:\s*)+")?,
        })
    }
}

pub struct KeywordExtractor {
    patterns: Patterns,
    vocabulary: Vec<(String, Regex)>,
}

impl KeywordExtractor {
    /// `vocabulary` is the set of category names to detect, usually the
    /// union of the supplier catalog's categories.
    pub fn new<I, S>(vocabulary: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let vocabulary = normalize_categories(vocabulary)
            .into_iter()
            .map(|term| {
                let singular = term.strip_suffix('s').unwrap_or(&term);
                let re = Regex::new(&format!(r"(?i)\b{}(?:s|es)?\b", regex::escape(singular)))?;
                Ok((term, re))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            patterns: Patterns::compile()?,
            vocabulary,
        })
    }

    fn items(&self, body: &str) -> Vec<LineItem> {
        let bulleted: Vec<LineItem> = body
            .lines()
            .filter_map(|line| self.patterns.bullet.captures(line))
            .filter_map(|caps| caps.name("text").map(|m| self.line_item(m.as_str())))
            .filter(|item| !item.description.is_empty())
            .collect();
        if !bulleted.is_empty() {
            return bulleted;
        }

        // Each "<qty> <unit> of" head owns the text up to the next head or punctuation.
        let heads: Vec<_> = self.patterns.inline_qty.captures_iter(body).collect();
        let mut items = Vec::new();
        for (i, caps) in heads.iter().enumerate() {
            let Some(head) = caps.get(0) else {
                continue;
            };
            let limit = heads
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(body.len(), |next| next.start());
            let tail = &body[head.end()..limit];
            let end = tail.find(['.', ',', ';', ':', '\n']).unwrap_or(tail.len());
            let description = clean_description(strip_conjunction(&tail[..end]));
            if description.is_empty() {
                continue;
            }
            items.push(LineItem {
                description,
                quantity: caps.name("qty").and_then(|q| parse_quantity(q.as_str())),
                unit: caps.name("unit").map(|u| normalize_unit(u.as_str())),
            });
        }
        items
    }

    fn line_item(&self, text: &str) -> LineItem {
        let text = text.trim();
        if let Some(caps) = self.patterns.leading_qty.captures(text) {
            let description = caps.name("desc").map(|d| clean_description(d.as_str()));
            if let Some(description) = description.filter(|d| !d.is_empty()) {
                return LineItem {
                    description,
                    quantity: caps.name("qty").and_then(|q| parse_quantity(q.as_str())),
                    unit: caps.name("unit").map(|u| normalize_unit(u.as_str())),
                };
            }
        }
        if let Some(caps) = self.patterns.trailing_qty.captures(text) {
            let description = caps.name("desc").map(|d| clean_description(d.as_str()));
            if let Some(description) = description.filter(|d| !d.is_empty()) {
                return LineItem {
                    description,
                    quantity: caps.name("qty").and_then(|q| parse_quantity(q.as_str())),
                    unit: caps.name("unit").map(|u| normalize_unit(u.as_str())),
                };
            }
        }
        LineItem {
            description: clean_description(text),
            quantity: None,
            unit: None,
        }
    }

    fn categories(&self, text: &str) -> Vec<String> {
        self.vocabulary
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(term, _)| term.clone())
            .collect()
    }

    fn delivery_location(&self, body: &str) -> Option<String> {
        let caps = self.patterns.delivery.captures(body)?;
        let raw = caps.name("loc")?.as_str();
        // "Rotterdam by 15 April" -> "Rotterdam"
        let cut = self
            .patterns
            .needed_by
            .find(raw)
            .map_or(raw, |m| &raw[..m.start()]);
        let location = cut.trim().trim_end_matches(',').trim();
        (!location.is_empty()).then(|| location.to_string())
    }

    fn needed_by(&self, body: &str) -> Option<String> {
        self.patterns
            .needed_by
            .captures(body)
            .and_then(|caps| caps.name("date"))
            .map(|m| m.as_str().trim().to_string())
    }

    fn company(&self, email: &EmailDocument) -> Option<String> {
        if let Some(name) = self
            .patterns
            .company
            .captures(&email.body)
            .and_then(|caps| caps.name("name"))
        {
            return Some(name.as_str().to_string());
        }
        let domain = email.sender.as_deref()?.rsplit_once('@')?.1;
        let label = domain.split('.').next()?.to_lowercase();
        if label.is_empty() || FREE_MAIL.contains(&label.as_str()) {
            return None;
        }
        let mut chars = label.chars();
        chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect())
    }

    fn summary(&self, email: &EmailDocument) -> String {
        let from_subject = email
            .subject
            .as_deref()
            .map(|s| self.patterns.subject_prefix.replace(s, "").trim().to_string())
            .filter(|s| !s.is_empty());
        let summary = from_subject.unwrap_or_else(|| {
            email
                .body
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && !l.ends_with(','))
                .unwrap_or_default()
                .to_string()
        });
        summary.chars().take(MAX_SUMMARY_CHARS).collect()
    }
}

#[async_trait]
impl Extractor for KeywordExtractor {
    fn name(&self) -> String {
        "keyword".to_string()
    }

    async fn extract(&self, email: &EmailDocument) -> Result<Extraction, ExtractError> {
        let searchable = format!("{}\n{}", email.subject.as_deref().unwrap_or_default(), email.body);
        Ok(Extraction {
            summary: self.summary(email),
            requester_name: email.sender_name.clone(),
            requester_company: self.company(email),
            categories: self.categories(&searchable),
            items: self.items(&email.body),
            delivery_location: self.delivery_location(&email.body),
            needed_by: self.needed_by(&email.body),
            extractor: self.name(),
        })
    }
}

fn parse_quantity(raw: &str) -> Option<Decimal> {
    raw.replace(',', "")
        .parse::<Decimal>()
        .ok()
        .filter(|q| !q.is_zero())
}

fn normalize_unit(raw: &str) -> String {
    match raw.to_lowercase().trim_end_matches('.') {
        "pc" | "piece" | "pieces" | "ea" | "each" | "unit" | "units" => "pcs".to_string(),
        "metres" | "meters" => "m".to_string(),
        "litres" | "liters" => "l".to_string(),
        "feet" => "ft".to_string(),
        "tons" | "tonnes" => "t".to_string(),
        other => other.to_string(),
    }
}

/// "stainless elbows and" -> "stainless elbows"
fn strip_conjunction(raw: &str) -> &str {
    let trimmed = raw.trim();
    [" and", " or", " plus", " &"]
        .iter()
        .find_map(|c| trimmed.strip_suffix(c))
        .unwrap_or(trimmed)
}

fn clean_description(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', ',', ';'])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn extractor() -> KeywordExtractor {
        KeywordExtractor::new(["valves", "pipe fittings", "fasteners", "gaskets"]).unwrap()
    }

    fn doc(subject: &str, body: &str) -> EmailDocument {
        EmailDocument {
            sender: Some("dana.reyes@northwind-industrial.example".into()),
            sender_name: Some("Dana Reyes".into()),
            subject: Some(subject.into()),
            body: body.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bulleted_rfq() {
        let email = doc(
            "RFQ: Valves and gaskets for Rotterdam plant",
            "Hello,\n\nWe would like a quote for:\n\
             - 40 pcs DN50 stainless ball valves\n\
             - Spiral wound gaskets DN50 x 120\n\
             - 2,000 M12 hex bolts\n\n\
             Delivery to Rotterdam, NL by 15 April 2026.\n\nRegards,\nDana",
        );
        let extraction = extractor().extract(&email).await.unwrap();

        assert_eq!(extraction.summary, "Valves and gaskets for Rotterdam plant");
        assert_eq!(extraction.items.len(), 3);
        assert_eq!(extraction.items[0].quantity, Some(dec!(40)));
        assert_eq!(extraction.items[0].unit.as_deref(), Some("pcs"));
        assert_eq!(extraction.items[0].description, "DN50 stainless ball valves");
        assert_eq!(extraction.items[1].description, "Spiral wound gaskets DN50");
        assert_eq!(extraction.items[1].quantity, Some(dec!(120)));
        assert_eq!(extraction.items[2].quantity, Some(dec!(2000)));
        assert_eq!(extraction.categories, vec!["valves".to_string(), "gaskets".to_string()]);
        assert_eq!(extraction.delivery_location.as_deref(), Some("Rotterdam, NL"));
        assert_eq!(extraction.needed_by.as_deref(), Some("15 April 2026"));
        assert_eq!(extraction.requester_company.as_deref(), Some("Northwind-industrial"));
        assert_eq!(extraction.extractor, "keyword");
    }

    #[tokio::test]
    async fn inline_quantities_without_bullets() {
        let email = doc(
            "Quote please",
            "Please quote 200 pcs of stainless elbows and 50 m of copper pipe, needed by 2026-05-01.",
        );
        let extraction = extractor().extract(&email).await.unwrap();
        assert_eq!(extraction.items.len(), 2);
        assert_eq!(extraction.items[0].description, "stainless elbows");
        assert_eq!(extraction.items[0].quantity, Some(dec!(200)));
        assert_eq!(extraction.items[1].description, "copper pipe");
        assert_eq!(extraction.items[1].unit.as_deref(), Some("m"));
        assert_eq!(extraction.needed_by.as_deref(), Some("2026-05-01"));
    }

    #[tokio::test]
    async fn nothing_recognizable() {
        let email = doc("Lunch?", "Are you free on Thursday?");
        let extraction = extractor().extract(&email).await.unwrap();
        assert!(extraction.is_empty());
        assert!(extraction.delivery_location.is_none());
    }

    #[test]
    fn plural_and_singular_vocabulary() {
        let extractor = extractor();
        assert_eq!(extractor.categories("one valve please"), vec!["valves".to_string()]);
        assert_eq!(extractor.categories("Pipe fittings"), vec!["pipe fittings".to_string()]);
    }

    #[test]
    fn company_header_wins_over_domain() {
        let extractor = extractor();
        let mut email = doc("x", "Company: Northwind Industrial BV\nThanks");
        assert_eq!(extractor.company(&email).as_deref(), Some("Northwind Industrial BV"));
        email.body = "Thanks".into();
        email.sender = Some("someone@gmail.com".into());
        assert!(extractor.company(&email).is_none());
    }

    #[test]
    fn units_are_normalized() {
        assert_eq!(normalize_unit("Pieces"), "pcs");
        assert_eq!(normalize_unit("metres"), "m");
        assert_eq!(normalize_unit("rolls"), "rolls");
    }
}
