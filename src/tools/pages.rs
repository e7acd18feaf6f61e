use std::collections::BTreeSet;

use crate::error::ApiError;

/// Parses `N` or `A-B` (1-based, inclusive) into a 1-based page span.
fn parse_token(token: &str, page_count: usize) -> Result<(usize, usize), ApiError> {
    let trimmed = token.trim();
    if let Some((start, end)) = trimmed.split_once('-') {
        let parsed = start.trim().parse::<usize>().ok().zip(end.trim().parse::<usize>().ok());
        return match parsed {
            Some((start, end)) if start >= 1 && start <= end && end <= page_count => Ok((start, end)),
            _ => Err(ApiError::bad_request(format!("Invalid page range \"{token}\"."))),
        };
    }

    match trimmed.parse::<usize>() {
        Ok(page) if page >= 1 && page <= page_count => Ok((page, page)),
        _ => Err(ApiError::bad_request(format!("Invalid page number \"{token}\"."))),
    }
}

fn tokens(value: &str) -> Vec<&str> {
    value.split(',').map(str::trim).filter(|t| !t.is_empty()).collect()
}

/// Zero-based, sorted, deduplicated page indexes. Empty or `all` selects every page.
pub fn parse_page_selection(value: &str, page_count: usize) -> Result<Vec<usize>, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return Ok((0..page_count).collect());
    }

    let tokens = tokens(trimmed);
    if tokens.is_empty() {
        return Err(ApiError::bad_request("Page selection cannot be empty."));
    }

    let mut indexes = BTreeSet::new();
    for token in tokens {
        let (start, end) = parse_token(token, page_count)?;
        indexes.extend((start..=end).map(|page| page - 1));
    }
    Ok(indexes.into_iter().collect())
}

/// Zero-based page groups in request order. Empty input yields one group per page.
pub fn parse_split_groups(value: &str, page_count: usize) -> Result<Vec<Vec<usize>>, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok((0..page_count).map(|index| vec![index]).collect());
    }

    let tokens = tokens(trimmed);
    if tokens.is_empty() {
        return Err(ApiError::bad_request("Split range cannot be empty."));
    }

    tokens
        .into_iter()
        .map(|token| {
            let (start, end) = parse_token(token, page_count)?;
            Ok((start - 1..end).collect())
        })
        .collect()
}
