// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, data_loss_error};

pub const CARD_LEN: usize = 80;

// Longest text that fits in a HISTORY or COMMENT card.
const COMMENTARY_TEXT_LEN: usize = CARD_LEN - 8;

// Longest quoted string that fits in the value field, from column 11.
const MAX_QUOTED_LEN: usize = CARD_LEN - 10;

// Continuation piece of a long string, leaving room for quotes and '&'.
const MAX_STRING_PIECE: usize = MAX_QUOTED_LEN - 3;

/// One header record. Value cards hold the raw FITS value text (string values
/// keep their single quotes); commentary cards (HISTORY, COMMENT, blank key)
/// have no value and keep their text in `comment`.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: Option<String>,
    pub comment: Option<String>,
}

impl HeaderCard {
    pub fn new(key: &str, value: &str, comment: Option<&str>) -> Self {
        HeaderCard{key: key.to_string(),
                   value: Some(value.to_string()),
                   comment: comment.map(|c| c.to_string())}
    }

    // String valued card; embedded quotes are doubled.
    pub fn string(key: &str, value: &str, comment: Option<&str>) -> Self {
        Self::new(key, format!("'{}'", value.replace('\'', "''")).as_str(),
                  comment)
    }

    pub fn int(key: &str, value: i64, comment: Option<&str>) -> Self {
        Self::new(key, value.to_string().as_str(), comment)
    }

    pub fn logical(key: &str, value: bool, comment: Option<&str>) -> Self {
        Self::new(key, if value { "T" } else { "F" }, comment)
    }

    pub fn commentary(key: &str, text: &str) -> Self {
        HeaderCard{key: key.to_string(), value: None,
                   comment: Some(text.to_string())}
    }

    /// Parses one card image. Trailing padding may be absent. Returns a
    /// DataLoss error for text that cannot be a FITS card.
    pub fn parse(card: &str) -> Result<Self, CanonicalError> {
        if !card.is_ascii() {
            return Err(data_loss_error(
                format!("Header card contains non-ASCII text: {:?}", card).as_str()));
        }
        if card.len() > CARD_LEN {
            return Err(data_loss_error(
                format!("Header card longer than {} characters: {:?}",
                        CARD_LEN, card).as_str()));
        }
        let key_end = card.len().min(8);
        let key = card[..key_end].trim_end();
        if key.contains(' ') {
            return Err(data_loss_error(
                format!("Malformed header keyword in {:?}", card).as_str()));
        }
        if card.len() < 10 || &card[8..10] != "= " {
            let text = if card.len() > 8 { card[8..].trim_end() } else { "" };
            return Ok(HeaderCard::commentary(key, text));
        }
        let (value, comment) = split_value_comment(&card[10..])?;
        Ok(HeaderCard{key: key.to_string(), value: Some(value), comment})
    }

    /// Card images, each padded to exactly 80 columns. A string value too
    /// long for one card is continued on CONTINUE cards, each piece but the
    /// last ending in '&'. The comment goes on the last card and is cut at
    /// column 80.
    pub fn card_images(&self) -> Vec<String> {
        let mut images = match &self.value {
            None => vec![format!("{:<8}{}", self.key,
                                 self.comment.as_deref().unwrap_or(""))],
            Some(value) if value.len() > MAX_QUOTED_LEN &&
                value.starts_with('\'') && value.ends_with('\'') => {
                let pieces = split_long_string(&value[1..value.len() - 1]);
                let last = pieces.len() - 1;
                pieces.iter().enumerate().map(|(i, piece)| {
                    let more = if i < last { "&" } else { "" };
                    if i == 0 {
                        format!("{:<8}= '{}{}'", self.key, piece, more)
                    } else {
                        format!("CONTINUE  '{}{}'", piece, more)
                    }
                }).collect()
            },
            // Fixed format: strings start in column 11, other values end in
            // column 30.
            Some(value) if value.starts_with('\'') =>
                vec![format!("{:<8}= {:<20}", self.key, value)],
            Some(value) => vec![format!("{:<8}= {:>20}", self.key, value)],
        };
        if let (Some(_), Some(comment), Some(last)) =
            (&self.value, &self.comment, images.last_mut()) {
            last.push_str(" / ");
            last.push_str(comment);
        }
        images.into_iter().map(|mut image| {
            image.truncate(CARD_LEN);
            format!("{:<width$}", image, width = CARD_LEN)
        }).collect()
    }

    // Appends a CONTINUE card's piece to this card's long string value.
    // Returns false, leaving the card alone, if this card's value does not
    // continue or `continuation` holds no string.
    fn continue_string(&mut self, continuation: &HeaderCard)
                       -> Result<bool, CanonicalError> {
        let Some(value) = self.value.as_mut() else {
            return Ok(false);
        };
        if value.len() < 3 || !value.ends_with("&'") {
            return Ok(false);
        }
        let text = continuation.comment.as_deref().unwrap_or("");
        if !text.trim_start().starts_with('\'') {
            return Ok(false);
        }
        let (piece, comment) = split_value_comment(text)?;
        value.truncate(value.len() - 2);
        value.push_str(&piece[1..]);
        if comment.is_some() {
            self.comment = comment;
        }
        Ok(true)
    }

    /// String value with quotes removed, or the raw value text for other
    /// value types.
    pub fn string_value(&self) -> Option<String> {
        let value = self.value.as_ref()?;
        if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            let inner = &value[1..value.len() - 1];
            return Some(inner.replace("''", "'").trim_end().to_string());
        }
        Some(value.clone())
    }

    pub fn f64_value(&self) -> Option<f64> {
        let value = self.value.as_ref()?;
        // Fortran style exponents are legal in FITS.
        value.trim().replace(['D', 'd'], "E").parse::<f64>().ok()
    }
}

// Splits escaped string text into pieces that fit a continued card, never
// separating the two quotes of an escaped quote.
fn split_long_string(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let mut token = c.to_string();
        if c == '\'' && chars.peek() == Some(&'\'') {
            chars.next();
            token.push('\'');
        }
        if current.len() + token.len() > MAX_STRING_PIECE {
            pieces.push(std::mem::take(&mut current));
        }
        current.push_str(&token);
    }
    pieces.push(current);
    pieces
}

fn split_value_comment(field: &str)
                       -> Result<(String, Option<String>), CanonicalError> {
    let trimmed = field.trim_start();
    if trimmed.starts_with('\'') {
        // Find the closing quote; '' is an escaped quote.
        let bytes = trimmed.as_bytes();
        let mut i = 1;
        let mut close = None;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                    continue;
                }
                close = Some(i);
                break;
            }
            i += 1;
        }
        let close = close.ok_or_else(|| data_loss_error(
            format!("Unterminated string value {:?}", field).as_str()))?;
        let value = trimmed[..=close].to_string();
        let rest = &trimmed[close + 1..];
        let comment = rest.find('/').map(|p| rest[p + 1..].trim().to_string());
        return Ok((value, comment));
    }
    match trimmed.find('/') {
        Some(p) => Ok((trimmed[..p].trim().to_string(),
                       Some(trimmed[p + 1..].trim().to_string()))),
        None => Ok((trimmed.trim_end().to_string(), None)),
    }
}

/// Ordered list of header cards. The END card is implicit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    cards: Vec<HeaderCard>,
}

impl Header {
    pub fn new() -> Self {
        Header{cards: Vec::new()}
    }

    pub fn from_cards(cards: Vec<HeaderCard>) -> Self {
        Header{cards}
    }

    /// Primary header describing a bare 2-D image, used when a slice has no
    /// header of its own.
    pub fn minimal(width: usize, height: usize) -> Self {
        Header{cards: vec![
            HeaderCard::logical("SIMPLE", true, Some("file conforms to FITS standard")),
            HeaderCard::int("BITPIX", -32, Some("number of bits per data pixel")),
            HeaderCard::int("NAXIS", 2, Some("number of data axes")),
            HeaderCard::int("NAXIS1", width as i64, Some("length of data axis 1")),
            HeaderCard::int("NAXIS2", height as i64, Some("length of data axis 2")),
        ]}
    }

    /// Parses newline separated card images, stopping at END. CONTINUE
    /// cards are folded back into the long string value they extend.
    pub fn parse_lines(text: &str) -> Result<Self, CanonicalError> {
        let mut cards: Vec<HeaderCard> = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if line.trim_end() == "END" {
                break;
            }
            let card = HeaderCard::parse(line.trim_end())?;
            if card.key == "CONTINUE" {
                if let Some(previous) = cards.last_mut() {
                    if previous.continue_string(&card)? {
                        continue;
                    }
                }
            }
            cards.push(card);
        }
        Ok(Header{cards})
    }

    /// One 80 column line per card, followed by END.
    pub fn to_lines(&self) -> String {
        let mut text = String::with_capacity((self.cards.len() + 1) * (CARD_LEN + 1));
        for card in &self.cards {
            for image in card.card_images() {
                text.push_str(image.as_str());
                text.push('\n');
            }
        }
        text.push_str(format!("{:<width$}\n", "END", width = CARD_LEN).as_str());
        text
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn find(&self, key: &str) -> Option<&HeaderCard> {
        self.cards.iter().find(|c| c.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.find(key).and_then(|c| c.string_value())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.find(key).and_then(|c| c.f64_value())
    }

    pub fn push(&mut self, card: HeaderCard) {
        self.cards.push(card);
    }

    /// Replaces the first card with the same key, or appends.
    pub fn set(&mut self, card: HeaderCard) {
        match self.cards.iter_mut().find(|c| c.key == card.key) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    /// Removes every card with `key`; returns how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        self.remove_where(|c| c.key == key)
    }

    pub fn remove_where<F>(&mut self, mut pred: F) -> usize
    where F: FnMut(&HeaderCard) -> bool {
        let before = self.cards.len();
        self.cards.retain(|c| !pred(c));
        before - self.cards.len()
    }

    // Long text is continued on additional HISTORY cards.
    pub fn add_history(&mut self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            self.cards.push(HeaderCard::commentary("HISTORY", ""));
            return;
        }
        for chunk in chars.chunks(COMMENTARY_TEXT_LEN) {
            let piece: String = chunk.iter().collect();
            self.cards.push(HeaderCard::commentary("HISTORY", piece.as_str()));
        }
    }
}

// mod tests.
