//! Parsers for the structured text of AT command responses.
//!
//! Everything a modem reports comes back as `+TAG: v0,v1,...` lines where
//! fields are either bare or double-quoted. One generic field parser covers
//! the lot; the command modules assemble typed records from the raw fields.
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, space0};
use nom::combinator::map;
use nom::multi::separated_list0;
use nom::sequence::{delimited, preceded};
use nom::IResult;

fn quoted_field(i: &str) -> IResult<&str, String> {
    map(
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        |s: &str| s.to_string(),
    )(i)
}

fn bare_field(i: &str) -> IResult<&str, String> {
    map(take_while(|c: char| c != ',' && c != '\n'), |s: &str| {
        s.trim().to_string()
    })(i)
}

fn field(i: &str) -> IResult<&str, String> {
    alt((quoted_field, bare_field))(i)
}

fn field_list(i: &str) -> IResult<&str, Vec<String>> {
    separated_list0(char(','), field)(i)
}

/// Parses one `+TAG: v0,v1,...` line into its raw field strings.
///
/// Quotes are stripped and their contents preserved; commas inside quotes
/// do not split. Returns `None` if the line does not carry `prefix` (the
/// full tag, e.g. `"+CSQ"`).
pub(crate) fn info_response(prefix: &str, line: &str) -> Option<Vec<String>> {
    let line = line.trim();
    let (rest, _) = preceded(tag::<_, _, nom::error::Error<&str>>(prefix), char(':'))(line).ok()?;
    let (rest, _) = space0::<_, nom::error::Error<&str>>(rest).ok()?;
    let (rest, fields) = field_list(rest).ok()?;
    if !rest.trim().is_empty() {
        return None;
    }
    Some(fields)
}

/// Applies `info_response` to every line of a multi-row response, keeping
/// the rows that carry the expected tag (CGDCONT, CGACT, CGPADDR, ...).
pub(crate) fn info_rows(prefix: &str, response: &str) -> Vec<Vec<String>> {
    response
        .lines()
        .filter_map(|line| info_response(prefix, line))
        .collect()
}

/// Parses the name out of an unsolicited `+XXX: ...` line: at least three
/// uppercase/digit characters between the `+` and the `:`.
pub(crate) fn notification_name(line: &str) -> Option<&str> {
    let (rest, name) = preceded(
        char::<_, nom::error::Error<&str>>('+'),
        take_while1(|c: char| c.is_ascii_uppercase() || c.is_ascii_digit()),
    )(line.trim())
    .ok()?;
    if name.len() >= 3 && rest.starts_with(':') {
        Some(name)
    } else {
        None
    }
}

/// Whether a line looks like the uppercase hex PDU body of a
/// `CMGL`/`CMGR` response.
pub(crate) fn is_hex_pdu(line: &str) -> bool {
    let line = line.trim();
    line.len() >= 2
        && line.len() % 2 == 0
        && line
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_and_quoted_fields() {
        assert_eq!(
            info_response("+CMGL", "+CMGL: 2,1,,24").unwrap(),
            vec!["2", "1", "", "24"]
        );
        assert_eq!(
            info_response("+COPS", "+COPS: 0,0,\"Foo, Bar\",7").unwrap(),
            vec!["0", "0", "Foo, Bar", "7"]
        );
    }
    #[test]
    fn prefix_mismatch_is_none() {
        assert!(info_response("+CMGR", "+CMGL: 2,1,,24").is_none());
        assert!(info_response("+CSQ", "OK").is_none());
    }
    #[test]
    fn nine_field_storage_row() {
        let fields = info_response(
            "+CPMS",
            "+CPMS: \"SM\",2,30,\"SM\",2,30,\"SM\",2,30",
        )
        .unwrap();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0], "SM");
        assert_eq!(fields[8], "30");
    }
    #[test]
    fn rows_pick_only_their_tag() {
        let resp = "+CGDCONT: 1,\"IP\",\"apn.example\"\n+CGDCONT: 2,\"IP\",\"other\"\nOK";
        let rows = info_rows("+CGDCONT", resp);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][2], "other");
    }
    #[test]
    fn notification_names() {
        assert_eq!(notification_name("+CMTI: \"SM\",4"), Some("CMTI"));
        assert_eq!(notification_name("+HCSQ: foo"), Some("HCSQ"));
        assert_eq!(notification_name("+OK: nope"), None);
        assert_eq!(notification_name("RING"), None);
        assert_eq!(notification_name("+cmti: 4"), None);
    }
    #[test]
    fn hex_pdu_lines() {
        assert!(is_hex_pdu("07911326880736F4"));
        assert!(!is_hex_pdu("07911326880736F"));
        assert!(!is_hex_pdu("07911326880736f4"));
        assert!(!is_hex_pdu("OK"));
    }
}
