use super::types::{Field, FieldKind, Operator, Predicate, QueryNode, Value};
use crate::error::{Result, SearchError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Colon,
    Value(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Or,
    To,
    Not,
    Op(Operator),
}

struct Tokenizer {
    input: Vec<char>,
    pos: usize,
}

impl Tokenizer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(ch) if ch.is_whitespace()) {
            self.advance();
        }
    }

    fn read_while<F>(&mut self, predicate: F) -> String
    where
        F: Fn(char) -> bool,
    {
        let mut result = String::new();
        while let Some(ch) = self.peek() {
            if predicate(ch) {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_quoted(&mut self) -> Result<String> {
        self.advance();
        let mut result = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(result),
                Some('\\') => match self.advance() {
                    Some(escaped) => result.push(escaped),
                    None => break,
                },
                Some(ch) => result.push(ch),
                None => break,
            }
        }
        Err(SearchError::invalid_query("unterminated quoted value"))
    }

    /// Operators directly after a colon: `>=`, `<=`, `>`, `<`, `!=`, `^`.
    fn read_operator(&mut self) -> Option<Operator> {
        let op = match (self.peek(), self.input.get(self.pos + 1).copied()) {
            (Some('>'), Some('=')) => Operator::Gte,
            (Some('<'), Some('=')) => Operator::Lte,
            (Some('!'), Some('=')) => Operator::Ne,
            (Some('>'), _) => Operator::Gt,
            (Some('<'), _) => Operator::Lt,
            (Some('^'), _) => Operator::Prefix,
            _ => return None,
        };
        self.pos += op.symbol().len();
        Some(op)
    }

    fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let Some(ch) = self.peek() else { break };

            match ch {
                '(' => {
                    self.advance();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.advance();
                    tokens.push(Token::RParen);
                }
                '[' => {
                    self.advance();
                    tokens.push(Token::LBracket);
                }
                ']' => {
                    self.advance();
                    tokens.push(Token::RBracket);
                }
                ':' => {
                    self.advance();
                    tokens.push(Token::Colon);
                    self.skip_whitespace();
                    if let Some(op) = self.read_operator() {
                        tokens.push(Token::Op(op));
                    }
                }
                '"' => {
                    let value = self.read_quoted()?;
                    tokens.push(Token::Value(value));
                }
                '!' | '-' if matches!(tokens.last(), None | Some(Token::Value(_)) | Some(Token::RParen) | Some(Token::RBracket)) => {
                    self.advance();
                    tokens.push(Token::Not);
                }
                _ if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' => {
                    let word = self.read_while(|c| {
                        c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
                    });
                    match word.as_str() {
                        "OR" => tokens.push(Token::Or),
                        "TO" => tokens.push(Token::To),
                        _ => {
                            self.skip_whitespace();
                            if self.peek() == Some(':') && !matches!(tokens.last(), Some(Token::Colon | Token::Op(_))) {
                                tokens.push(Token::Field(word));
                            } else {
                                tokens.push(Token::Value(word));
                            }
                        }
                    }
                }
                _ => {
                    return Err(SearchError::invalid_query(format!(
                        "unexpected character '{}' at position {}",
                        ch, self.pos
                    )));
                }
            }
        }

        Ok(tokens)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(&mut self) -> Result<Vec<QueryNode>> {
        let mut nodes = Vec::new();
        while self.peek().is_some() {
            nodes.push(self.parse_term()?);
        }
        Ok(nodes)
    }

    fn parse_term(&mut self) -> Result<QueryNode> {
        let negated = if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            true
        } else {
            false
        };

        let field = match self.advance() {
            Some(Token::Field(name)) => resolve_field(&name)?,
            other => {
                return Err(SearchError::invalid_query(format!(
                    "expected field name, found {:?}",
                    other
                )))
            }
        };

        match self.advance() {
            Some(Token::Colon) => {}
            _ => return Err(SearchError::invalid_query("expected ':' after field name")),
        }

        let node = match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.advance();
                let raw = self.parse_raw_value()?;
                predicate(&field, op, typed_value(&field, &raw)?)?
            }
            Some(Token::LParen) => {
                let values = self
                    .parse_group()?
                    .iter()
                    .map(|raw| typed_value(&field, raw))
                    .collect::<Result<Vec<_>>>()?;
                predicate(&field, Operator::In, Value::List(values))?
            }
            Some(Token::LBracket) => {
                let (min, max) = self.parse_range()?;
                QueryNode::And(vec![
                    predicate(&field, Operator::Gte, typed_value(&field, &min)?)?,
                    predicate(&field, Operator::Lte, typed_value(&field, &max)?)?,
                ])
            }
            _ => {
                let raw = self.parse_raw_value()?;
                predicate(&field, Operator::Eq, typed_value(&field, &raw)?)?
            }
        };

        Ok(if negated {
            QueryNode::Not(vec![node])
        } else {
            node
        })
    }

    fn parse_group(&mut self) -> Result<Vec<String>> {
        self.advance();

        let mut values = vec![self.parse_raw_value()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            values.push(self.parse_raw_value()?);
        }

        match self.advance() {
            Some(Token::RParen) => Ok(values),
            _ => Err(SearchError::invalid_query("expected closing parenthesis")),
        }
    }

    fn parse_range(&mut self) -> Result<(String, String)> {
        self.advance();

        let min = self.parse_raw_value()?;
        match self.advance() {
            Some(Token::To) => {}
            _ => return Err(SearchError::invalid_query("expected TO in range")),
        }
        let max = self.parse_raw_value()?;

        match self.advance() {
            Some(Token::RBracket) => Ok((min, max)),
            _ => Err(SearchError::invalid_query("expected closing bracket")),
        }
    }

    fn parse_raw_value(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Value(v)) => Ok(v),
            other => Err(SearchError::invalid_query(format!(
                "expected value, found {:?}",
                other
            ))),
        }
    }
}

/// `option.Color`, `product-metafield.ns.key`, `variant-custom-field.name`, or a vocabulary field.
fn resolve_field(name: &str) -> Result<Field> {
    let Some((qualifier, rest)) = name.split_once('.') else {
        return Field::named(name);
    };
    match qualifier {
        "option" => Ok(Field::option(rest)),
        "product-metafield" | "variant-metafield" => {
            let (namespace, key) = rest.split_once('.').ok_or_else(|| {
                SearchError::invalid_query(format!("metafield must be qualifier.namespace.key: {}", name))
            })?;
            Ok(if qualifier == "product-metafield" {
                Field::product_metafield(namespace, key)
            } else {
                Field::variant_metafield(namespace, key)
            })
        }
        "product-custom-field" => Ok(Field::ProductCustomField(rest.to_string())),
        "variant-custom-field" => Ok(Field::VariantCustomField(rest.to_string())),
        _ => Err(SearchError::invalid_query(format!("unknown field '{}'", name))),
    }
}

pub(crate) fn typed_value(field: &Field, raw: &str) -> Result<Value> {
    let mismatch = || {
        SearchError::invalid_query(format!("value '{}' does not fit field '{}'", raw, field))
    };
    match field.kind() {
        FieldKind::Qualitative => Ok(Value::String(raw.to_string())),
        FieldKind::Quantitative => {
            if let Ok(i) = raw.parse::<i64>() {
                Ok(Value::Integer(i))
            } else {
                raw.parse::<f64>().map(Value::Number).map_err(|_| mismatch())
            }
        }
        FieldKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => Err(mismatch()),
        },
        FieldKind::Any => {
            if let Ok(i) = raw.parse::<i64>() {
                Ok(Value::Integer(i))
            } else if let Ok(f) = raw.parse::<f64>() {
                Ok(Value::Number(f))
            } else if raw.eq_ignore_ascii_case("true") {
                Ok(Value::Boolean(true))
            } else if raw.eq_ignore_ascii_case("false") {
                Ok(Value::Boolean(false))
            } else {
                Ok(Value::String(raw.to_string()))
            }
        }
    }
}

fn predicate(field: &Field, operator: Operator, operand: Value) -> Result<QueryNode> {
    Ok(QueryNode::Predicate(Predicate::new(field.clone(), operator, operand)?))
}

/// Parse the compact filter language (`price:>=10 vendor:(Nike OR Adidas) -tag:sale`)
/// into conjoined query nodes.
pub fn parse_filter(input: &str) -> Result<Vec<QueryNode>> {
    let mut tokenizer = Tokenizer::new(input);
    let tokens = tokenizer.tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse()
}
