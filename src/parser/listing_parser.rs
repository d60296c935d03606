// Rule-driven listing extraction
use crate::config::{Field, SelectorRules};
use crate::model::{ListingRecord, ParseError, RawPage};
use crate::normalizer::{normalize_text, parse_availability, parse_price};
use crate::utils::absolute_url;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use tracing::debug;

pub trait Parser {
    fn parse(&self, page: &RawPage) -> Result<Extraction, ParseError>;
}

/// Records taken from one page, plus how many entries were dropped for
/// lacking a critical field.
#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<ListingRecord>,
    pub dropped: usize,
}

struct CompiledRule {
    /// `None` reads the item element itself.
    selector: Option<Selector>,
    attribute: Option<String>,
}

pub struct ListingParser {
    anchor_source: String,
    anchor: Selector,
    item: Selector,
    fields: BTreeMap<Field, CompiledRule>,
    sold_out_markers: Vec<String>,
}

fn compile(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

impl ListingParser {
    pub fn new(rules: &SelectorRules) -> Result<Self, ParseError> {
        let mut fields = BTreeMap::new();
        for (field, rule) in &rules.fields {
            let selector = if rule.selector.trim().is_empty() {
                None
            } else {
                Some(compile(&rule.selector)?)
            };
            fields.insert(
                *field,
                CompiledRule {
                    selector,
                    attribute: rule.attribute.clone(),
                },
            );
        }

        Ok(Self {
            anchor_source: rules.list_anchor.clone(),
            anchor: compile(&rules.list_anchor)?,
            item: compile(&rules.item)?,
            fields,
            sold_out_markers: rules.sold_out_markers.clone(),
        })
    }

    fn lookup(&self, item: ElementRef<'_>, field: Field) -> Option<String> {
        let rule = self.fields.get(&field)?;
        let element = match &rule.selector {
            Some(selector) => item.select(selector).next()?,
            None => item,
        };
        match &rule.attribute {
            Some(attr) => element.value().attr(attr).and_then(normalize_text),
            None => normalize_text(&element.text().collect::<String>()),
        }
    }

    /// Builds one record, or names the critical field that was missing.
    fn extract_item(
        &self,
        item: ElementRef<'_>,
        page_url: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<ListingRecord, Field> {
        let id = self.lookup(item, Field::Identifier).ok_or(Field::Identifier)?;
        let price = self
            .lookup(item, Field::Price)
            .and_then(|p| parse_price(&p))
            .ok_or(Field::Price)?;

        Ok(ListingRecord {
            id,
            name: self.lookup(item, Field::Name),
            price,
            size: self.lookup(item, Field::Size),
            availability: parse_availability(
                self.lookup(item, Field::Availability).as_deref(),
                &self.sold_out_markers,
            ),
            url: self
                .lookup(item, Field::Url)
                .and_then(|link| absolute_url(&link, page_url)),
            captured_at,
        })
    }
}

impl Parser for ListingParser {
    fn parse(&self, page: &RawPage) -> Result<Extraction, ParseError> {
        let document = Html::parse_document(&page.html);
        let anchors: Vec<ElementRef<'_>> = document.select(&self.anchor).collect();
        if anchors.is_empty() {
            return Err(ParseError::MissingAnchor(self.anchor_source.clone()));
        }

        let captured_at = Utc::now();
        let mut extraction = Extraction::default();
        for item in anchors.iter().flat_map(|a| a.select(&self.item)) {
            match self.extract_item(item, &page.url, captured_at) {
                Ok(record) => extraction.records.push(record),
                Err(field) => {
                    extraction.dropped += 1;
                    debug!(
                        "Dropped listing on {} (page {}): missing {:?}",
                        page.url, page.query.page, field
                    );
                }
            }
        }

        Ok(extraction)
    }
}
