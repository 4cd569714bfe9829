//! Text traces of cache requests, one request per line.
//!
//! ```text
//! # write-back: <port> <addr> <value>
//! 0 0x10 42
//! 1 17   7
//! shutdown
//!
//! # single-line
//! set 0x10 1,2,3,4
//! get 0x12
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hex. `#` starts a comment.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    character::complete::{char, digit1, hex_digit1, space0, space1},
    combinator::{all_consuming, map, map_res, recognize, value},
    multi::separated_list1,
    sequence::{pair, preceded, separated_pair, tuple},
    IResult,
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("line {line}: cannot parse `{text}`")]
    Syntax { line: usize, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBackOp {
    Store { port: usize, addr: i64, value: u32 },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleLineOp {
    Get { addr: u64 },
    Set { addr: u64, line: Vec<u32> },
}

fn unsigned(i: &str) -> IResult<&str, u64> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |h| {
            u64::from_str_radix(h, 16)
        }),
        map_res(digit1, str::parse),
    ))(i)
}

fn signed(i: &str) -> IResult<&str, i64> {
    alt((
        map_res(recognize(pair(char('-'), digit1)), str::parse),
        map_res(unsigned, i64::try_from),
    ))(i)
}

fn word(i: &str) -> IResult<&str, u32> {
    map_res(unsigned, u32::try_from)(i)
}

fn write_back_op(i: &str) -> IResult<&str, WriteBackOp> {
    alt((
        value(WriteBackOp::Shutdown, tag("shutdown")),
        map(
            tuple((
                map_res(unsigned, usize::try_from),
                preceded(space1, signed),
                preceded(space1, word),
            )),
            |(port, addr, value)| WriteBackOp::Store { port, addr, value },
        ),
    ))(i)
}

fn single_line_op(i: &str) -> IResult<&str, SingleLineOp> {
    alt((
        map(preceded(pair(tag("get"), space1), unsigned), |addr| {
            SingleLineOp::Get { addr }
        }),
        map(
            preceded(
                pair(tag("set"), space1),
                separated_pair(
                    unsigned,
                    space1,
                    separated_list1(tuple((space0, char(','), space0)), word),
                ),
            ),
            |(addr, line)| SingleLineOp::Set { addr, line },
        ),
    ))(i)
}

fn parse_lines<'a, O>(
    src: &'a str,
    mut op: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> Result<Vec<O>, TraceError> {
    let mut ops = Vec::new();
    for (index, raw) in src.lines().enumerate() {
        let text = raw.split('#').next().unwrap_or_default().trim();
        if text.is_empty() {
            continue;
        }
        let (_, parsed) = all_consuming(|i| op(i))(text).map_err(|_| TraceError::Syntax {
            line: index + 1,
            text: text.to_owned(),
        })?;
        ops.push(parsed);
    }
    Ok(ops)
}

pub fn parse_write_back(src: &str) -> Result<Vec<WriteBackOp>, TraceError> {
    parse_lines(src, write_back_op)
}

pub fn parse_single_line(src: &str) -> Result<Vec<SingleLineOp>, TraceError> {
    parse_lines(src, single_line_op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers() {
        assert_eq!(Ok(("", 0x1f)), unsigned("0x1F"));
        assert_eq!(Ok(("", 0)), unsigned("0"));
        assert_eq!(Ok(("", -12)), signed("-12"));
        assert_eq!(Ok((" 3", 12)), signed("12 3"));
        assert!(word("0x100000000").is_err());
    }
    #[test]
    fn test_write_back_trace() {
        let src = "# header\n0 0x10 42\n\n  1 17\t7  # trailing\nshutdown\n";
        assert_eq!(
            Ok(vec![
                WriteBackOp::Store {
                    port: 0,
                    addr: 16,
                    value: 42
                },
                WriteBackOp::Store {
                    port: 1,
                    addr: 17,
                    value: 7
                },
                WriteBackOp::Shutdown,
            ]),
            parse_write_back(src)
        );
    }
    #[test]
    fn test_single_line_trace() {
        let src = "set 0x10 1, 2,3 ,4\nget 0x12\n";
        assert_eq!(
            Ok(vec![
                SingleLineOp::Set {
                    addr: 16,
                    line: vec![1, 2, 3, 4]
                },
                SingleLineOp::Get { addr: 18 },
            ]),
            parse_single_line(src)
        );
    }
    #[test]
    fn test_syntax_error_reports_line() {
        assert_eq!(
            Err(TraceError::Syntax {
                line: 2,
                text: "0 1".to_owned()
            }),
            parse_write_back("0 0 0\n0 1\n")
        );
        assert!(parse_single_line("get").is_err());
        assert!(parse_single_line("get 1 2").is_err());
    }
}
