use super::intern::Symbol;
use crate::frontend::{
    SourceFile,
    ast::{
        BinaryOperatorKind, Block, Expression, ExpressionKind, FunctionDefinition, GlobalVariable,
        Identifier, Item, ItemKind, Module, Parameter, Statement, StatementKind, TypeKind,
        TypeSpecifier, UnaryOperatorKind,
    },
    lexer::{Keyword, Lexer, Span, Token, TokenKind},
};

#[derive(Debug)]
pub struct Parser<'source> {
    lexer: Lexer<'source>,
}

impl<'source> Parser<'source> {
    pub fn parse_module(source_file: &'source SourceFile) -> Module<'source> {
        let mut parser = Self {
            lexer: Lexer::new(source_file),
        };

        let mut module = Module {
            source_file,
            items: Vec::new(),
        };

        while parser.lexer.peek().is_some() {
            module.items.push(parser.parse_item());
        }

        module
    }

    fn report_fatal_error(&self, offending_span: Span, message: &str) -> ! {
        self.lexer.source().report_fatal_error(offending_span, message)
    }

    fn end_of_file_span(&self) -> Span {
        let end = self.lexer.source().contents.len();
        Span::new(end.saturating_sub(1), end)
    }

    fn expect_peek(&mut self, expecting: &str) -> Token {
        let Some(token) = self.lexer.peek() else {
            self.report_fatal_error(
                self.end_of_file_span(),
                &format!("Expected {expecting} but reached end of file"),
            )
        };

        token
    }

    fn expect_next(&mut self, expecting: &str) -> Token {
        let Some(token) = self.lexer.next() else {
            self.report_fatal_error(
                self.end_of_file_span(),
                &format!("Expected {expecting} but reached end of file"),
            )
        };

        token
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> Token {
        let token = self.expect_next(&format!("{kind:?}"));

        if token.kind != kind {
            self.report_fatal_error(
                token.span,
                &format!(
                    "Expected {:?} but found {:?} ({})",
                    kind,
                    token.kind,
                    self.lexer.source().value_of_span(token.span)
                ),
            )
        }

        token
    }

    /// int g = 5; | int f(int a) { ... }
    fn parse_item(&mut self) -> Item {
        let ty = self.parse_type_specifier();
        let name = self.parse_identifier();

        match self.expect_peek("function parameter list or global initializer").kind {
            TokenKind::OpenParen => {
                let function = Box::new(self.parse_function_definition(ty, name));

                Item {
                    span: function.span,
                    kind: ItemKind::FunctionDefinition(function),
                }
            }
            _ => {
                let global = Box::new(self.parse_global_variable(ty, name));

                Item {
                    span: global.span,
                    kind: ItemKind::GlobalVariable(global),
                }
            }
        }
    }

    // int | long | short | char
    fn parse_type_specifier(&mut self) -> TypeSpecifier {
        let token = self.expect_next("type specifier");

        let kind = match token.kind {
            TokenKind::Keyword(Keyword::Char) => TypeKind::Char,
            TokenKind::Keyword(Keyword::Short) => TypeKind::Short,
            TokenKind::Keyword(Keyword::Int) => TypeKind::Int,
            TokenKind::Keyword(Keyword::Long) => TypeKind::Long,
            kind => self.report_fatal_error(
                token.span,
                &format!(
                    "Expected type specifier but found {:?} ({})",
                    kind,
                    self.lexer.source().value_of_span(token.span)
                ),
            ),
        };

        TypeSpecifier {
            span: token.span,
            kind,
        }
    }

    // main
    fn parse_identifier(&mut self) -> Identifier {
        let token = self.expect_next_to_be(TokenKind::Identifier);

        Identifier {
            span: token.span,
            symbol: Symbol::new(self.lexer.source().value_of_span(token.span)),
        }
    }

    /// (int a, int b) { ... }, after the return type and name were consumed
    fn parse_function_definition(
        &mut self,
        return_type: TypeSpecifier,
        name: Identifier,
    ) -> FunctionDefinition {
        let parameters = self.parse_parameter_list();
        let body = self.parse_block();

        FunctionDefinition {
            span: Span::new(return_type.span.start, body.span.end),
            return_type,
            name,
            parameters,
            body,
        }
    }

    // (int a, int b)
    fn parse_parameter_list(&mut self) -> Vec<Parameter> {
        let mut parameters = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen);

        // If the next token is not a closing paren, there MUST be at least one
        // parameter
        if self.expect_peek("parameter or closing paren").kind != TokenKind::CloseParen {
            parameters.push(self.parse_parameter());

            // While the next token is a comma try and parse more parameters
            while self
                .lexer
                .peek()
                .is_some_and(|t| t.kind == TokenKind::Comma)
            {
                self.expect_next_to_be(TokenKind::Comma);
                parameters.push(self.parse_parameter());
            }
        }

        self.expect_next_to_be(TokenKind::CloseParen);

        parameters
    }

    // int a
    fn parse_parameter(&mut self) -> Parameter {
        let ty = self.parse_type_specifier();
        let name = self.parse_identifier();

        Parameter {
            span: Span::new(ty.span.start, name.span.end),
            ty,
            name,
        }
    }

    /// = 5; (after the type and name were consumed). Only constant
    /// initializers are representable in the data section.
    fn parse_global_variable(&mut self, ty: TypeSpecifier, name: Identifier) -> GlobalVariable {
        let initializer = (self.expect_peek("global initializer or semicolon").kind
            == TokenKind::Equals)
            .then(|| {
                self.expect_next_to_be(TokenKind::Equals);
                self.parse_constant_integer()
            });

        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        GlobalVariable {
            span: Span::new(ty.span.start, semicolon.span.end),
            ty,
            name,
            initializer,
        }
    }

    // 42 | -42
    fn parse_constant_integer(&mut self) -> i64 {
        let negated = self.expect_peek("integer constant").kind == TokenKind::Minus;

        if negated {
            self.expect_next_to_be(TokenKind::Minus);
        }

        let token = self.expect_next_to_be(TokenKind::IntegerLiteral);
        let value = self.integer_value_of(token);

        if negated { -value } else { value }
    }

    fn integer_value_of(&self, token: Token) -> i64 {
        let text = self.lexer.source().value_of_span(token.span);

        let Ok(value) = text.parse::<i64>() else {
            self.report_fatal_error(
                token.span,
                &format!("Integer literal out of range: {text}"),
            )
        };

        value
    }

    // { ... }
    fn parse_block(&mut self) -> Block {
        let open_brace = self.expect_next_to_be(TokenKind::OpenBrace);

        let mut statements = Vec::new();

        while self.expect_peek("statement or closing brace").kind != TokenKind::CloseBrace {
            statements.push(self.parse_statement());
        }

        let close_brace = self.expect_next_to_be(TokenKind::CloseBrace);

        Block {
            span: Span::new(open_brace.span.start, close_brace.span.end),
            statements,
        }
    }

    /// A braced block, or a single statement wrapped into one
    fn parse_statement_or_block(&mut self) -> Block {
        if self.expect_peek("statement or block").kind == TokenKind::OpenBrace {
            return self.parse_block();
        }

        let statement = self.parse_statement();

        Block {
            span: statement.span,
            statements: vec![statement],
        }
    }

    fn parse_statement(&mut self) -> Statement {
        let peeked = self.expect_peek("statement");

        match peeked.kind {
            kind if kind.is_type_specifier() => self.parse_declaration(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Identifier
                if self
                    .lexer
                    .peek_nth(1)
                    .is_some_and(|t| t.kind == TokenKind::Equals) =>
            {
                self.parse_assignment()
            }
            _ => {
                let expression = Box::new(self.parse_expression());
                let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

                Statement {
                    span: Span::new(expression.span.start, semicolon.span.end),
                    kind: StatementKind::Expression(expression),
                }
            }
        }
    }

    // int x = 10; | int x;
    fn parse_declaration(&mut self) -> Statement {
        let ty = self.parse_type_specifier();
        let name = self.parse_identifier();

        let initializer = (self.expect_peek("initializer or semicolon").kind == TokenKind::Equals)
            .then(|| {
                self.expect_next_to_be(TokenKind::Equals);
                Box::new(self.parse_expression())
            });

        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        Statement {
            span: Span::new(ty.span.start, semicolon.span.end),
            kind: StatementKind::Declaration {
                ty,
                name,
                initializer,
            },
        }
    }

    // x = 10;
    fn parse_assignment(&mut self) -> Statement {
        let target = self.parse_identifier();
        self.expect_next_to_be(TokenKind::Equals);
        let value = Box::new(self.parse_expression());
        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        Statement {
            span: Span::new(target.span.start, semicolon.span.end),
            kind: StatementKind::Assignment { target, value },
        }
    }

    // return 42; | return;
    fn parse_return(&mut self) -> Statement {
        let return_keyword = self.expect_next_to_be(TokenKind::Keyword(Keyword::Return));

        let value = (self.expect_peek("return value or semicolon").kind != TokenKind::Semicolon)
            .then(|| Box::new(self.parse_expression()));

        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        Statement {
            span: Span::new(return_keyword.span.start, semicolon.span.end),
            kind: StatementKind::Return { value },
        }
    }

    // if (c) { ... } else { ... }
    fn parse_if(&mut self) -> Statement {
        let if_keyword = self.expect_next_to_be(TokenKind::Keyword(Keyword::If));

        self.expect_next_to_be(TokenKind::OpenParen);
        let condition = Box::new(self.parse_expression());
        self.expect_next_to_be(TokenKind::CloseParen);

        let then_block = self.parse_statement_or_block();

        let else_block = self
            .lexer
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword(Keyword::Else))
            .then(|| {
                self.expect_next_to_be(TokenKind::Keyword(Keyword::Else));
                self.parse_statement_or_block()
            });

        let end = else_block
            .as_ref()
            .map(|block| block.span.end)
            .unwrap_or(then_block.span.end);

        Statement {
            span: Span::new(if_keyword.span.start, end),
            kind: StatementKind::If {
                condition,
                then_block,
                else_block,
            },
        }
    }

    // while (c) { ... }
    fn parse_while(&mut self) -> Statement {
        let while_keyword = self.expect_next_to_be(TokenKind::Keyword(Keyword::While));

        self.expect_next_to_be(TokenKind::OpenParen);
        let condition = Box::new(self.parse_expression());
        self.expect_next_to_be(TokenKind::CloseParen);

        let body = self.parse_statement_or_block();

        Statement {
            span: Span::new(while_keyword.span.start, body.span.end),
            kind: StatementKind::While { condition, body },
        }
    }

    // a + b < c * 2
    fn parse_expression(&mut self) -> Expression {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Expression {
        let mut lhs = self.parse_term();

        while let Some(token) = self.lexer.peek() {
            if !token.kind.is_comparison_operator() {
                break;
            }

            self.lexer.next();
            let rhs = self.parse_term();

            lhs = self.new_binary_expression(token.kind, lhs, rhs);
        }

        lhs
    }

    fn parse_term(&mut self) -> Expression {
        let mut lhs = self.parse_factor();

        while let Some(token) = self.lexer.peek() {
            if !token.kind.is_term_operator() {
                break;
            }

            self.lexer.next();
            let rhs = self.parse_factor();

            lhs = self.new_binary_expression(token.kind, lhs, rhs);
        }

        lhs
    }

    fn parse_factor(&mut self) -> Expression {
        let mut lhs = self.parse_unary();

        while let Some(token) = self.lexer.peek() {
            if !token.kind.is_factor_operator() {
                break;
            }

            self.lexer.next();
            let rhs = self.parse_unary();

            lhs = self.new_binary_expression(token.kind, lhs, rhs);
        }

        lhs
    }

    fn new_binary_expression(
        &self,
        operator: TokenKind,
        lhs: Expression,
        rhs: Expression,
    ) -> Expression {
        let operator = match operator {
            TokenKind::Plus => BinaryOperatorKind::Add,
            TokenKind::Minus => BinaryOperatorKind::Subtract,
            TokenKind::Asterisk => BinaryOperatorKind::Multiply,
            TokenKind::Divide => BinaryOperatorKind::Divide,
            TokenKind::Modulus => BinaryOperatorKind::Modulus,
            TokenKind::DoubleEquals => BinaryOperatorKind::Equals,
            TokenKind::NotEquals => BinaryOperatorKind::NotEquals,
            TokenKind::LessThan => BinaryOperatorKind::LessThan,
            TokenKind::LessThanOrEqualTo => BinaryOperatorKind::LessThanOrEqualTo,
            TokenKind::GreaterThan => BinaryOperatorKind::GreaterThan,
            TokenKind::GreaterThanOrEqualTo => BinaryOperatorKind::GreaterThanOrEqualTo,
            kind => unreachable!("token {kind:?} is not a binary operator"),
        };

        Expression {
            span: Span::new(lhs.span.start, rhs.span.end),
            kind: ExpressionKind::Binary {
                operator,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        }
    }

    fn parse_unary(&mut self) -> Expression {
        let peeked = self.expect_peek("expression");

        if peeked.kind == TokenKind::Minus {
            let minus = self.expect_next_to_be(TokenKind::Minus);
            let operand = self.parse_unary();

            return Expression {
                span: Span::new(minus.span.start, operand.span.end),
                kind: ExpressionKind::Unary {
                    operator: UnaryOperatorKind::Negate,
                    operand: Box::new(operand),
                },
            };
        }

        self.parse_primary()
    }

    // 42 | x | f(a, b) | (a + b)
    fn parse_primary(&mut self) -> Expression {
        let peeked = self.expect_peek("expression");

        match peeked.kind {
            TokenKind::IntegerLiteral => {
                let token = self.expect_next_to_be(TokenKind::IntegerLiteral);

                Expression {
                    span: token.span,
                    kind: ExpressionKind::IntegerLiteral(self.integer_value_of(token)),
                }
            }
            TokenKind::Identifier => {
                let identifier = self.parse_identifier();

                if self
                    .lexer
                    .peek()
                    .is_some_and(|t| t.kind == TokenKind::OpenParen)
                {
                    return self.parse_function_call(identifier);
                }

                Expression {
                    span: identifier.span,
                    kind: ExpressionKind::Variable(identifier),
                }
            }
            TokenKind::OpenParen => {
                self.expect_next_to_be(TokenKind::OpenParen);
                let inner = self.parse_expression();
                self.expect_next_to_be(TokenKind::CloseParen);

                inner
            }
            kind => self.report_fatal_error(
                peeked.span,
                &format!(
                    "Expected expression but found {:?} ({})",
                    kind,
                    self.lexer.source().value_of_span(peeked.span)
                ),
            ),
        }
    }

    // f(a, b + 1)
    fn parse_function_call(&mut self, callee: Identifier) -> Expression {
        let mut arguments = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen);

        if self.expect_peek("call argument or closing paren").kind != TokenKind::CloseParen {
            arguments.push(self.parse_expression());

            while self
                .lexer
                .peek()
                .is_some_and(|t| t.kind == TokenKind::Comma)
            {
                self.expect_next_to_be(TokenKind::Comma);
                arguments.push(self.parse_expression());
            }
        }

        let close_paren = self.expect_next_to_be(TokenKind::CloseParen);

        Expression {
            span: Span::new(callee.span.start, close_paren.span.end),
            kind: ExpressionKind::FunctionCall { callee, arguments },
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::frontend::SourceFileOrigin;

    fn parse(source: &str) -> Vec<String> {
        let source = SourceFile {
            contents: source.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let module = Parser::parse_module(&source);

        module
            .items
            .iter()
            .map(|item| match &item.kind {
                ItemKind::FunctionDefinition(f) => {
                    format!("fn {} ({} params)", f.name.symbol, f.parameters.len())
                }
                ItemKind::GlobalVariable(g) => {
                    format!("global {} = {:?}", g.name.symbol, g.initializer)
                }
            })
            .collect()
    }

    #[test]
    fn parses_function_and_global_items() {
        let items = parse(indoc! {"
            int counter = -3;

            int add(int a, int b)
            {
                return a + b;
            }
        "});

        assert_eq!(items, vec!["global counter = Some(-3)", "fn add (2 params)"]);
    }

    #[test]
    fn parses_precedence() {
        let source = SourceFile {
            contents: "int main() { return 1 + 2 * 3 < 10; }".to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let module = Parser::parse_module(&source);

        let ItemKind::FunctionDefinition(function) = &module.items[0].kind else {
            panic!("expected function definition");
        };

        let StatementKind::Return { value: Some(value) } = &function.body.statements[0].kind else {
            panic!("expected return statement");
        };

        // (1 + (2 * 3)) < 10
        let ExpressionKind::Binary {
            operator: BinaryOperatorKind::LessThan,
            lhs,
            ..
        } = &value.kind
        else {
            panic!("expected comparison at the root");
        };

        assert!(matches!(
            lhs.kind,
            ExpressionKind::Binary {
                operator: BinaryOperatorKind::Add,
                ..
            }
        ));
    }

    #[test]
    fn parses_control_flow() {
        let items = parse(indoc! {"
            int main()
            {
                int n = 10;
                int sum = 0;
                while (n > 0) {
                    sum = sum + n;
                    n = n - 1;
                }
                if (sum == 55) { return 1; } else { return 0; }
            }
        "});

        assert_eq!(items, vec!["fn main (0 params)"]);
    }
}
