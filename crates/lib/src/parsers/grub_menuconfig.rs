//! Parser for GRUB menuentry configuration files using nom combinators.

use std::fmt::Display;

use nom::{
    bytes::complete::{escaped, tag, take_until},
    character::complete::{multispace0, multispace1, none_of},
    error::{Error, ErrorKind, ParseError},
    sequence::delimited,
    Err, IResult, Parser,
};

/// Body of a menuentry.
#[derive(Debug, PartialEq, Eq, Default)]
pub(crate) struct MenuentryBody<'a> {
    /// Arguments of the `linux` command: kernel path and command line
    pub(crate) linux: &'a str,
    /// Arguments of the `initrd` command
    pub(crate) initrd: &'a str,
    /// Any other commands, in order
    pub(crate) extra: Vec<(&'a str, &'a str)>,
}

impl<'a> Display for MenuentryBody<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, v) in &self.extra {
            writeln!(f, "    {k} {v}")?;
        }
        writeln!(f, "    linux {}", self.linux)?;
        writeln!(f, "    initrd {}", self.initrd)
    }
}

impl<'a> From<Vec<(&'a str, &'a str)>> for MenuentryBody<'a> {
    fn from(vec: Vec<(&'a str, &'a str)>) -> Self {
        let mut entry = Self::default();
        for (key, value) in vec {
            match key {
                "linux" => entry.linux = value,
                "initrd" => entry.initrd = value,
                _ => entry.extra.push((key, value)),
            }
        }
        entry
    }
}

/// A complete GRUB menuentry with title and body commands.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MenuEntry<'a> {
    /// Display title (supports escaped quotes)
    pub(crate) title: String,
    /// Commands within the menuentry block
    pub(crate) body: MenuentryBody<'a>,
}

impl<'a> Display for MenuEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "menuentry \"{}\" {{", self.title)?;
        write!(f, "{}", self.body)?;
        writeln!(f, "}}")
    }
}

/// Parser that takes content until balanced brackets, handling nested brackets and escapes.
fn take_until_balanced_allow_nested(
    opening_bracket: char,
    closing_bracket: char,
) -> impl Fn(&str) -> IResult<&str, &str> {
    move |i: &str| {
        let mut index = 0;
        let mut bracket_counter = 0;

        while let Some(n) = &i[index..].find(&[opening_bracket, closing_bracket, '\\'][..]) {
            index += n;
            let mut characters = i[index..].chars();

            match characters.next().unwrap_or_default() {
                '\\' => {
                    index += '\\'.len_utf8();
                    // Skip the escaped character
                    let c = characters.next().unwrap_or_default();
                    index += c.len_utf8();
                }
                c if c == opening_bracket => {
                    bracket_counter += 1;
                    index += opening_bracket.len_utf8();
                }
                c if c == closing_bracket => {
                    bracket_counter -= 1;
                    index += closing_bracket.len_utf8();
                }
                _ => unreachable!(),
            };

            // The unmatched closing bracket ends the body; leave it for `tag`
            if bracket_counter == -1 {
                index -= closing_bracket.len_utf8();
                return Ok((&i[index..], &i[0..index]));
            };
        }

        if bracket_counter == 0 {
            Ok(("", i))
        } else {
            Err(Err::Error(Error::from_error_kind(i, ErrorKind::TakeUntil)))
        }
    }
}

/// Parses a single menuentry with title and body commands.
fn parse_menuentry(input: &str) -> IResult<&str, MenuEntry<'_>> {
    let (input, _) = tag("menuentry").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, title) = delimited(
        tag("\""),
        escaped(none_of("\\\""), '\\', none_of("")),
        tag("\""),
    )
    .parse(input)?;
    // Options such as --id may follow the title
    let (input, _) = take_until("{").parse(input)?;
    let (input, body) = delimited(
        tag("{"),
        take_until_balanced_allow_nested('{', '}'),
        tag("}"),
    )
    .parse(input)?;

    let map = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once(' '))
        .map(|(k, v)| (k, v.trim()))
        .collect::<Vec<_>>();

    Ok((
        input,
        MenuEntry {
            title: title.to_string(),
            body: MenuentryBody::from(map),
        },
    ))
}

fn skip_to_menuentry(input: &str) -> IResult<&str, ()> {
    let (input, _) = take_until("menuentry")(input)?;
    Ok((input, ()))
}

fn parse_all(input: &str) -> IResult<&str, Vec<MenuEntry<'_>>> {
    let mut entries = Vec::new();

    let Ok((mut remaining, _)) = skip_to_menuentry(input) else {
        return Ok(("", entries));
    };

    while !remaining.trim().is_empty() {
        let (next, entry) = parse_menuentry(remaining)?;
        entries.push(entry);
        let (next, _) = multispace0(next)?;
        remaining = next;

        match skip_to_menuentry(remaining) {
            Ok((next, _)) => remaining = next,
            // Trailing content that is not an entry
            Err(_) => break,
        }
    }

    Ok((remaining, entries))
}

/// Parse every menuentry in `contents`, in file order.
pub(crate) fn parse_grub_menuentry_file(contents: &str) -> anyhow::Result<Vec<MenuEntry<'_>>> {
    let (_, entries) = parse_all(contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse GRUB menuentries: {e}"))?;
    for entry in &entries {
        if entry.title.is_empty() {
            anyhow::bail!("Found menuentry with empty title");
        }
    }
    Ok(entries)
}
