//! The table-driven scanner.
//!
//! A character-class DFA over two closed tables: character -> class and
//! state x class -> state. Identifiers are folded to upper case; reserved
//! words are detected by lookup in the global symbol table. Constant tokens
//! carry the sub-kind decided by the accepting state. A scan error halts the
//! scan and is reported with up to six characters of context.
//!
//! Complex-literal states are recognized by the tables but rejected: the
//! value model carries no complex kind.

use crate::{
    intern::Interns,
    symtab::{Role, Symtabs},
    token::{ConstKind, Token, TokenProp, TokenStream},
};

/// A scan failure: the message is delivered to the caller as a fault value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub message: String,
}

// Scanner states.
const ST: u8 = 0; // start
const ID: u8 = 1; // identifier
const CO: u8 = 2; // comment
const S: u8 = 3; // string body
const S1: u8 = 4; // string after closing quote
const P: u8 = 5; // phrase
const N: u8 = 6; // integer
const D: u8 = 7; // leading dot
const R1: u8 = 8; // real, fractional digits
const R2: u8 = 9; // real, exponent marker
const R3: u8 = 10; // real, exponent sign
const R4: u8 = 11; // real, exponent digits
const F: u8 = 12; // fault
const SY: u8 = 13; // single-character symbol
const C0: u8 = 14; // complex states C0..C7
const C1: u8 = 15;
const C2: u8 = 16;
const C3: u8 = 17;
const C4: u8 = 18;
const C5: u8 = 19;
const C6: u8 = 20;
const C7: u8 = 21;
const DM: u8 = 22; // delimiter
const GE: u8 = 23; // gets (':' / ':=')
const LO: u8 = 24; // '<' family
const HI: u8 = 25; // '>' family
const UE: u8 = 26; // '~='
const M: u8 = 27; // '~'
const TD: u8 = 28; // '~.'
const DA: u8 = 29; // '-'
const BO: u8 = 30; // boolean bits
const CH: u8 = 31; // '`'
const FC: u8 = 32; // char after '`'

const STATE_COUNT: usize = 33;

// Pseudo-states returned by the transition table.
const FI: u8 = 35; // finish the scan
const A: u8 = 36; // accept the token ending before this character
const RP: u8 = 37; // replace the character with a blank and continue

// Error states.
const E1: u8 = 40;
const E2: u8 = 41;
const E3: u8 = 42;
const E4: u8 = 43;
const E5: u8 = 44;
const E6: u8 = 45;
const E7: u8 = 46;
const E8: u8 = 47;
const E9: u8 = 48;

// Character classes.
const L: u8 = 0; // letter
const DI: u8 = 1; // digit
const DE: u8 = 2; // delimiter
const U: u8 = 3; // unused
const DO: u8 = 4; // dot
const UN: u8 = 5; // underscore
const FT: u8 = 6; // '?'
const PH: u8 = 7; // '"'
const Q: u8 = 8; // quote
const C: u8 = 9; // '%'
const CL: u8 = 10; // colon
const EQ: u8 = 11; // '='
const EL: u8 = 12; // end of line
const LE: u8 = 13; // letter e/E
const BL: u8 = 14; // blank
const TI: u8 = 15; // '~'
const DS: u8 = 16; // dash
const SE: u8 = 17; // semicolon
const SM: u8 = 18; // symbol
const LJ: u8 = 19; // letter j/J
const LT: u8 = 20; // '<'
const GT: u8 = 21; // '>'
const LB: u8 = 22; // letter l/o
const CG: u8 = 23; // grave
const CC: u8 = 24; // DEL
const PL: u8 = 25; // '+'

const CLASS_COUNT: usize = 26;

/// State x class transition table.
#[rustfmt::skip]
const TRANSITION: [[u8; CLASS_COUNT]; STATE_COUNT] = [
    //        L   DI  DE  U   DO  UN  FT  PH  Q   C   CL  EQ  EL  LE  BL  TI  DS  SE  SM  LJ  LT  GT  LB  CG  CC  PL
    /* St */ [ID, N,  DM, ST, D,  ID, F,  P,  S,  CO, GE, SY, FI, ID, ST, M,  DA, DM, SY, ID, LO, HI, BO, CH, ST, SY],
    /* I  */ [ID, ID, A,  A,  A,  ID, A,  A,  A,  A,  A,  A,  A,  ID, A,  A,  A,  A,  A,  ID, A,  A,  ID, A,  A,  A],
    /* Co */ [CO, CO, CO, RP, CO, CO, CO, CO, CO, CO, CO, CO, A,  CO, CO, CO, CO, A,  CO, CO, CO, CO, CO, CO, CO, CO],
    /* S  */ [S,  S,  S,  S,  S,  S,  S,  S,  S1, S,  S,  S,  E1, S,  S,  S,  S,  S,  S,  S,  S,  S,  S,  S,  S,  S],
    /* S1 */ [A,  A,  A,  A,  A,  A,  A,  A,  S,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* P  */ [P,  P,  A,  RP, P,  P,  P,  P,  P,  P,  P,  P,  A,  P,  A,  P,  P,  A,  P,  P,  P,  P,  P,  P,  P,  P],
    /* N  */ [A,  N,  A,  A,  R1, A,  A,  A,  A,  A,  A,  A,  A,  R2, A,  A,  A,  A,  A,  C0, A,  A,  A,  A,  A,  A],
    /* D  */ [A,  R1, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* R1 */ [A,  R1, A,  A,  E9, A,  A,  A,  A,  A,  A,  A,  A,  R2, A,  A,  A,  A,  A,  C0, A,  A,  A,  A,  A,  A],
    /* R2 */ [E3, R4, E3, E3, E9, E3, E3, E3, E3, E3, E3, E3, E3, E3, E3, R3, R3, E3, E3, C0, E3, E3, E3, E3, E3, R3],
    /* R3 */ [E3, R4, E3, E3, E9, E3, E3, E3, E3, E3, E3, E3, E3, E3, E3, E3, E3, E3, E3, C0, E3, E3, E3, E3, E3, E3],
    /* R4 */ [A,  R4, A,  A,  E9, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  C0, A,  A,  A,  A,  A,  A],
    /* F  */ [F,  F,  A,  RP, F,  F,  F,  F,  F,  F,  F,  F,  A,  F,  A,  F,  F,  A,  F,  F,  F,  F,  F,  F,  F,  F],
    /* Sy */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* C0 */ [E4, C2, E4, E9, C3, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, C1, C1, E4, E4, E4, E4, E4, E4, E4, E4, E4],
    /* C1 */ [E4, C2, E4, E9, C3, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4, E4],
    /* C2 */ [A,  C2, A,  E9, C4, A,  A,  A,  A,  A,  A,  A,  A,  C5, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* C3 */ [E5, C4, E5, E9, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5, E5],
    /* C4 */ [A,  C4, A,  E9, A,  A,  A,  A,  A,  A,  A,  A,  A,  C5, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* C5 */ [E6, C7, E6, E9, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, C6, C6, E6, E6, E6, E6, E6, E6, E6, E6, C6],
    /* C6 */ [E6, C7, E6, E9, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6, E6],
    /* C7 */ [A,  C7, A,  E9, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* Dm */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* Ge */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  GE, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* Lo */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  LO, A,  A,  A,  A,  A,  A,  A,  A,  LO, A,  A,  A,  A,  A],
    /* Hi */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  HI, A,  A,  A,  A,  A,  A,  A,  A,  A,  HI, A,  A,  A,  A],
    /* Ue */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* M  */ [A,  A,  A,  A,  TD, A,  A,  A,  A,  A,  A,  UE, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* Td */ [E2, R1, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2, E2],
    /* Da */ [A,  N,  A,  A,  TD, A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
    /* Bo */ [ID, ID, A,  A,  A,  ID, A,  A,  A,  A,  A,  A,  A,  ID, A,  A,  A,  A,  A,  ID, A,  A,  BO, A,  A,  A],
    /* Ch */ [FC, FC, FC, FC, FC, FC, FC, FC, FC, FC, FC, FC, E8, FC, FC, FC, FC, FC, FC, FC, FC, FC, FC, FC, FC, FC],
    /* Fc */ [A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A,  A],
];

/// Character -> class map for the ASCII range; everything above is a letter.
#[rustfmt::skip]
const CLASS: [u8; 128] = [
    EL, U,  U,  U,  U,  U,  U,  U,   // 0
    U,  BL, EL, U,  U,  U,  U,  U,   // 8
    U,  U,  U,  U,  U,  U,  U,  U,   // 16
    U,  U,  U,  U,  U,  U,  U,  U,   // 24
    BL, SM, PH, DE, SM, C,  L,  Q,   // 32:  ! " # $ % & '
    DE, DE, SM, PL, DE, DS, DO, SM,  // 40: ( ) * + , - . /
    DI, DI, DI, DI, DI, DI, DI, DI,  // 48: 0-7
    DI, DI, CL, SE, LT, EQ, GT, FT,  // 56: 8 9 : ; < = > ?
    SM, L,  L,  L,  L,  LE, L,  L,   // 64: @ A-G
    L,  L,  LJ, L,  LB, L,  L,  LB,  // 72: H-O
    L,  L,  L,  L,  L,  L,  L,  L,   // 80: P-W
    L,  L,  L,  DE, SM, DE, SM, UN,  // 88: X Y Z [ \ ] ^ _
    CG, L,  L,  L,  L,  LE, L,  L,   // 96: ` a-g
    L,  L,  LJ, L,  LB, L,  L,  LB,  // 104: h-o
    L,  L,  L,  L,  L,  L,  L,  L,   // 112: p-w
    L,  L,  L,  DE, SM, DE, TI, CC,  // 120: x y z { | } ~ DEL
];

fn char_class(c: char) -> u8 {
    let code = c as u32;
    if code < 128 {
        CLASS[code as usize]
    } else {
        L
    }
}

fn error_message(state: u8, context: &str) -> String {
    let mess = match state {
        E1 => "missing ' at end of string: ",
        E2 => "fractional part of real number missing: ",
        E3 => "exponent of real number missing: ",
        E4 => "imaginary part of complex number missing: ",
        E5 => "fractional part of imaginary number missing: ",
        E6 => "exponent of imaginary number missing: ",
        E7 => "undefined character after ` : ",
        E8 => "missing character after ` : ",
        E9 => "extra period in number after ",
        _ => "",
    };
    format!("?SCAN - {mess}{context}")
}

/// Scans source lines into one token stream, with an `eol` formatting token
/// between lines. Reserved words are detected against the global symbol
/// table; the interning tables are consulted read-only.
pub(crate) fn scan_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
    symtabs: &Symtabs,
    interns: &Interns,
) -> Result<TokenStream, ScanError> {
    let mut stream = TokenStream::new();
    let mut first = true;
    for line in lines {
        if !first {
            stream.push(TokenProp::Eol, "");
        }
        first = false;
        scan_line(line, symtabs, interns, &mut stream)?;
    }
    Ok(stream)
}

fn scan_line(line: &str, symtabs: &Symtabs, interns: &Interns, stream: &mut TokenStream) -> Result<(), ScanError> {
    let chars: Vec<char> = line.chars().chain(std::iter::once('\n')).collect();
    let mut state = ST;
    let mut token = String::new();
    let mut j = 0usize;
    while j < chars.len() {
        let character = chars[j];
        let class = char_class(character);
        let last_state = state;
        state = TRANSITION[last_state as usize][class as usize];

        if state == ST {
            token.clear();
            j += 1;
        } else if state == RP {
            token.push(' ');
            state = last_state;
            j += 1;
        } else if state == FI {
            break;
        } else if (E1..=E9).contains(&state) {
            let context: String = token.chars().take(6).collect();
            return Err(ScanError {
                message: error_message(state, &context),
            });
        } else if state == A {
            if matches!(last_state, C2 | C4 | C7) {
                return Err(ScanError {
                    message: format!("?SCAN - complex constants are not supported: {token}"),
                });
            }
            stream.tokens.push(make_token(&token, last_state, symtabs, interns));
            token.clear();
            state = ST;
            // The current character is re-examined for the next token.
        } else {
            token.push(character);
            j += 1;
        }
    }
    Ok(())
}

/// Builds a token from its accepted text and the state it was accepted from.
fn make_token(text: &str, state: u8, symtabs: &Symtabs, interns: &Interns) -> Token {
    match state {
        CO => {
            // Trailing blanks are trimmed from comments.
            Token::new(TokenProp::Comment, text.trim_end_matches(' '))
        }
        ID | SY | LO | HI | UE | DA | M => {
            let upper = text.to_uppercase();
            let reserved = interns
                .lookup_phrase(&upper)
                .and_then(|name| symtabs.global().lookup(name, interns))
                .is_some_and(|entry| symtabs.global().entry(entry).role == Role::Reserved);
            if reserved {
                Token::new(TokenProp::Delim, upper)
            } else {
                Token::new(TokenProp::Identifier, upper)
            }
        }
        DM | D | GE => Token::new(TokenProp::Delim, text),
        S1 => Token::new(TokenProp::Const(ConstKind::Str), text),
        P => Token::new(TokenProp::Const(ConstKind::Phrase), text),
        N => Token::new(TokenProp::Const(ConstKind::Int), text),
        R1 | R4 => Token::new(TokenProp::Const(ConstKind::Real), text),
        F => Token::new(TokenProp::Const(ConstKind::Fault), text),
        BO => Token::new(TokenProp::Const(ConstKind::Bool), text),
        FC => Token::new(TokenProp::Const(ConstKind::Char), text),
        _ => Token::new(TokenProp::Delim, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{interp::Interpreter, resource::HeapLimits};

    fn scan_one(src: &str) -> Result<TokenStream, ScanError> {
        let interp = Interpreter::new(HeapLimits::default());
        scan_lines(std::iter::once(src), &interp.symtabs, &interp.interns)
    }

    fn texts(stream: &TokenStream) -> Vec<(&TokenProp, &str)> {
        stream.tokens.iter().map(|t| (&t.prop, t.text.as_str())).collect()
    }

    #[test]
    fn identifiers_fold_to_upper_case() {
        let stream = scan_one("count gets 3").unwrap();
        let tokens = texts(&stream);
        assert_eq!(tokens[0], (&TokenProp::Identifier, "COUNT"));
        assert_eq!(tokens[1], (&TokenProp::Delim, "GETS"));
        assert_eq!(tokens[2], (&TokenProp::Const(ConstKind::Int), "3"));
    }

    #[test]
    fn symbols_become_operators_or_delimiters() {
        let stream = scan_one("a := b + 1").unwrap();
        let tokens = texts(&stream);
        assert_eq!(tokens[1], (&TokenProp::Delim, ":="));
        assert_eq!(tokens[3], (&TokenProp::Identifier, "+"));
    }

    #[test]
    fn literal_sub_kinds() {
        let stream = scan_one("2 3.5 llo `x 'it''s' \"word ?oops").unwrap();
        let kinds: Vec<TokenProp> = stream.tokens.iter().map(|t| t.prop).collect();
        assert_eq!(
            kinds,
            vec![
                TokenProp::Const(ConstKind::Int),
                TokenProp::Const(ConstKind::Real),
                TokenProp::Const(ConstKind::Bool),
                TokenProp::Const(ConstKind::Char),
                TokenProp::Const(ConstKind::Str),
                TokenProp::Const(ConstKind::Phrase),
                TokenProp::Const(ConstKind::Fault),
            ]
        );
        assert_eq!(stream.tokens[4].text, "'it''s'");
    }

    #[test]
    fn negative_numbers_and_minus_operator() {
        let stream = scan_one("-3 a - b").unwrap();
        let tokens = texts(&stream);
        assert_eq!(tokens[0], (&TokenProp::Const(ConstKind::Int), "-3"));
        assert_eq!(tokens[2], (&TokenProp::Identifier, "-"));
    }

    #[test]
    fn comments_swallow_to_semicolon() {
        let stream = scan_one("% a remark  ; x").unwrap();
        assert_eq!(stream.tokens[0].prop, TokenProp::Comment);
        assert_eq!(stream.tokens[0].text, "% a remark");
        assert!(stream.tokens[1].is_delim(";"));
        assert_eq!(stream.tokens[2].text, "X");
    }

    #[test]
    fn unterminated_string_is_a_scan_error() {
        let err = scan_one("'oops").unwrap_err();
        assert!(err.message.starts_with("?SCAN - missing '"), "{}", err.message);
    }

    #[test]
    fn double_at_scans_as_two_delimiters() {
        let stream = scan_one("a@@p").unwrap();
        let tokens = texts(&stream);
        assert_eq!(tokens[1], (&TokenProp::Delim, "@"));
        assert_eq!(tokens[2], (&TokenProp::Delim, "@"));
    }
}
