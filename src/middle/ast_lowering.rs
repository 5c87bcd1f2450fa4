use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};

use crate::{
    frontend::{
        SourceFile,
        ast::{
            self, BinaryOperatorKind, ExpressionKind, ItemKind, StatementKind, TypeKind,
            UnaryOperatorKind,
        },
        intern::Symbol,
    },
    index::Index,
    middle::ir::{
        BinaryOp, CompareOp, IrFunction, IrGlobalVariable, IrInstruction, IrParameter, IrProgram,
        IrType, IrVariable, LabelId, Operand, TempId,
    },
};

/// Lowers a parsed module into the flattened IR consumed by the backend.
///
/// All user-facing name diagnostics (duplicate definitions, undeclared
/// variables, bad calls) are reported here, before any backend stage runs,
/// so the IR handed over always satisfies the backend's input contract.
pub struct IrGenerator<'ast> {
    module: &'ast ast::Module<'ast>,
    /// Arity of every function in the module, for call checking
    signatures: HashMap<Symbol, usize>,
    next_label: LabelId,
}

impl<'ast> IrGenerator<'ast> {
    pub fn generate(module: &'ast ast::Module<'ast>) -> IrProgram {
        let mut generator = Self {
            module,
            signatures: HashMap::new(),
            next_label: LabelId::new(0),
        };

        generator.collect_signatures();

        let mut globals = Vec::new();
        let mut functions = Vec::new();

        for item in &module.items {
            match &item.kind {
                ItemKind::GlobalVariable(global) => globals.push(IrGlobalVariable {
                    name: global.name.symbol,
                    ty: lower_type(global.ty.kind),
                    initial_value: global.initializer,
                }),
                ItemKind::FunctionDefinition(function) => {
                    functions.push(generator.lower_function(function));
                }
            }
        }

        if !generator.signatures.contains_key(&Symbol::new("main")) {
            eprintln!("error: program defines no 'main' function");
            std::process::exit(1);
        }

        IrProgram {
            globals,
            functions,
            label_count: generator.next_label.index(),
        }
    }

    /// Registers every item name up front, so functions may call functions
    /// defined later in the file, and duplicates are caught early.
    fn collect_signatures(&mut self) {
        let mut defined: HashSet<Symbol> = HashSet::new();

        for item in &self.module.items {
            let (name, arity) = match &item.kind {
                ItemKind::FunctionDefinition(function) => {
                    (function.name, Some(function.parameters.len()))
                }
                ItemKind::GlobalVariable(global) => (global.name, None),
            };

            if !defined.insert(name.symbol) {
                self.module.source_file.report_fatal_error(
                    name.span,
                    &format!("'{}' is defined more than once", name.symbol),
                );
            }

            if let Some(arity) = arity {
                self.signatures.insert(name.symbol, arity);
            }
        }
    }

    fn lower_function(&mut self, function: &ast::FunctionDefinition) -> IrFunction {
        let mut context = FunctionLoweringContext {
            source_file: self.module.source_file,
            signatures: &self.signatures,
            parameters: Vec::new(),
            locals: BTreeMap::new(),
            instructions: Vec::new(),
            next_temp: TempId::new(0),
            next_label: &mut self.next_label,
        };

        for parameter in &function.parameters {
            context.declare_parameter(parameter);
        }

        context.lower_block(&function.body);

        context.into_output(function.name.symbol, lower_type(function.return_type.kind))
    }
}

fn lower_type(kind: TypeKind) -> IrType {
    match kind {
        TypeKind::Char => IrType::CHAR,
        TypeKind::Short => IrType::SHORT,
        TypeKind::Int => IrType::INT,
        TypeKind::Long => IrType::LONG,
    }
}

struct FunctionLoweringContext<'ast> {
    source_file: &'ast SourceFile,
    signatures: &'ast HashMap<Symbol, usize>,

    parameters: Vec<IrParameter>,
    locals: BTreeMap<Symbol, IrVariable>,
    instructions: Vec<IrInstruction>,
    next_temp: TempId,
    next_label: &'ast mut LabelId,
}

impl<'ast> FunctionLoweringContext<'ast> {
    fn create_temp(&mut self) -> TempId {
        let temp = self.next_temp;
        self.next_temp.increment_by(1);
        temp
    }

    fn create_label(&mut self) -> LabelId {
        let label = *self.next_label;
        self.next_label.increment_by(1);
        label
    }

    fn push_instruction(&mut self, instruction: IrInstruction) {
        self.instructions.push(instruction);
    }

    fn is_declared(&self, name: Symbol) -> bool {
        self.locals.contains_key(&name) || self.parameters.iter().any(|p| p.name == name)
    }

    fn declare_parameter(&mut self, parameter: &ast::Parameter) {
        if self.is_declared(parameter.name.symbol) {
            self.source_file.report_fatal_error(
                parameter.name.span,
                &format!("parameter '{}' is declared more than once", parameter.name.symbol),
            );
        }

        self.parameters.push(IrParameter {
            name: parameter.name.symbol,
            ty: lower_type(parameter.ty.kind),
        });
    }

    fn declare_local(&mut self, name: ast::Identifier, ty: IrType) {
        if self.is_declared(name.symbol) {
            self.source_file.report_fatal_error(
                name.span,
                &format!("variable '{}' is declared more than once", name.symbol),
            );
        }

        self.locals.insert(
            name.symbol,
            IrVariable {
                name: name.symbol,
                ty,
            },
        );
    }

    fn into_output(mut self, name: Symbol, return_type: IrType) -> IrFunction {
        // A body may fall off its closing brace without an explicit return.
        // Completing it here keeps the IR contract simple: the backend never
        // has to invent a return path.
        if !matches!(self.instructions.last(), Some(IrInstruction::Return { .. })) {
            self.instructions.push(IrInstruction::Return {
                value: Some(Operand::Const(0)),
            });
        }

        IrFunction {
            name,
            return_type,
            parameters: self.parameters,
            locals: self.locals,
            temp_count: self.next_temp.index(),
            instructions: self.instructions,
        }
    }

    fn lower_block(&mut self, block: &ast::Block) {
        for statement in &block.statements {
            self.lower_statement(statement);
        }
    }

    fn lower_statement(&mut self, statement: &ast::Statement) {
        match &statement.kind {
            StatementKind::Declaration {
                ty,
                name,
                initializer,
            } => {
                self.declare_local(*name, lower_type(ty.kind));

                if let Some(initializer) = initializer {
                    let value = self.lower_expression(initializer);
                    self.push_instruction(IrInstruction::StoreVar {
                        variable: name.symbol,
                        source: value,
                    });
                }
            }
            StatementKind::Assignment { target, value } => {
                if !self.is_declared(target.symbol) {
                    self.source_file.report_fatal_error(
                        target.span,
                        &format!("assignment to undeclared variable '{}'", target.symbol),
                    );
                }

                let value = self.lower_expression(value);
                self.push_instruction(IrInstruction::StoreVar {
                    variable: target.symbol,
                    source: value,
                });
            }
            StatementKind::Return { value } => {
                let value = value.as_deref().map(|value| self.lower_expression(value));
                self.push_instruction(IrInstruction::Return { value });
            }
            StatementKind::If {
                condition,
                then_block,
                else_block,
            } => self.lower_if(condition, then_block, else_block.as_ref()),
            StatementKind::While { condition, body } => self.lower_while(condition, body),
            StatementKind::Expression(expression) => {
                // Evaluated for side effects (calls); the value is discarded
                self.lower_expression(expression);
            }
        }
    }

    fn lower_if(
        &mut self,
        condition: &ast::Expression,
        then_block: &ast::Block,
        else_block: Option<&ast::Block>,
    ) {
        let condition = self.lower_expression(condition);

        match else_block {
            Some(else_block) => {
                let else_label = self.create_label();
                let end_label = self.create_label();

                self.push_instruction(IrInstruction::JumpIfZero {
                    condition,
                    target: else_label,
                });
                self.lower_block(then_block);
                self.push_instruction(IrInstruction::Jump { target: end_label });
                self.push_instruction(IrInstruction::Label(else_label));
                self.lower_block(else_block);
                self.push_instruction(IrInstruction::Label(end_label));
            }
            None => {
                let end_label = self.create_label();

                self.push_instruction(IrInstruction::JumpIfZero {
                    condition,
                    target: end_label,
                });
                self.lower_block(then_block);
                self.push_instruction(IrInstruction::Label(end_label));
            }
        }
    }

    fn lower_while(&mut self, condition: &ast::Expression, body: &ast::Block) {
        let start_label = self.create_label();
        let end_label = self.create_label();

        self.push_instruction(IrInstruction::Label(start_label));
        let condition = self.lower_expression(condition);
        self.push_instruction(IrInstruction::JumpIfZero {
            condition,
            target: end_label,
        });
        self.lower_block(body);
        self.push_instruction(IrInstruction::Jump {
            target: start_label,
        });
        self.push_instruction(IrInstruction::Label(end_label));
    }

    fn lower_expression(&mut self, expression: &ast::Expression) -> Operand {
        match &expression.kind {
            ExpressionKind::IntegerLiteral(value) => {
                let destination = self.create_temp();
                self.push_instruction(IrInstruction::LoadConst {
                    destination,
                    value: *value,
                });

                Operand::Temp(destination)
            }
            ExpressionKind::Variable(identifier) => {
                if !self.is_declared(identifier.symbol) {
                    self.source_file.report_fatal_error(
                        identifier.span,
                        &format!("use of undeclared variable '{}'", identifier.symbol),
                    );
                }

                let destination = self.create_temp();
                self.push_instruction(IrInstruction::LoadVar {
                    destination,
                    variable: identifier.symbol,
                });

                Operand::Temp(destination)
            }
            ExpressionKind::Unary {
                operator: UnaryOperatorKind::Negate,
                operand,
            } => {
                // Fold a negated literal instead of emitting 0 - x
                if let ExpressionKind::IntegerLiteral(value) = &operand.kind {
                    let destination = self.create_temp();
                    self.push_instruction(IrInstruction::LoadConst {
                        destination,
                        value: -*value,
                    });

                    return Operand::Temp(destination);
                }

                let operand = self.lower_expression(operand);
                let destination = self.create_temp();
                self.push_instruction(IrInstruction::Binary {
                    operator: BinaryOp::Subtract,
                    destination,
                    lhs: Operand::Const(0),
                    rhs: operand,
                });

                Operand::Temp(destination)
            }
            ExpressionKind::Binary { operator, lhs, rhs } => {
                let lhs = self.lower_expression(lhs);
                let rhs = self.lower_expression(rhs);
                let destination = self.create_temp();

                let instruction = if operator.is_comparison() {
                    IrInstruction::Compare {
                        operator: lower_compare_operator(*operator),
                        destination,
                        lhs,
                        rhs,
                    }
                } else {
                    IrInstruction::Binary {
                        operator: lower_binary_operator(*operator),
                        destination,
                        lhs,
                        rhs,
                    }
                };
                self.push_instruction(instruction);

                Operand::Temp(destination)
            }
            ExpressionKind::FunctionCall { callee, arguments } => {
                let Some(arity) = self.signatures.get(&callee.symbol).copied() else {
                    self.source_file.report_fatal_error(
                        callee.span,
                        &format!("call to undefined function '{}'", callee.symbol),
                    )
                };

                if arity != arguments.len() {
                    self.source_file.report_fatal_error(
                        expression.span,
                        &format!(
                            "function '{}' takes {} argument(s) but {} were supplied",
                            callee.symbol,
                            arity,
                            arguments.len()
                        ),
                    );
                }

                let arguments = arguments
                    .iter()
                    .map(|argument| self.lower_expression(argument))
                    .collect();

                let destination = self.create_temp();
                self.push_instruction(IrInstruction::Call {
                    destination: Some(destination),
                    callee: callee.symbol,
                    arguments,
                });

                Operand::Temp(destination)
            }
        }
    }
}

fn lower_binary_operator(operator: BinaryOperatorKind) -> BinaryOp {
    match operator {
        BinaryOperatorKind::Add => BinaryOp::Add,
        BinaryOperatorKind::Subtract => BinaryOp::Subtract,
        BinaryOperatorKind::Multiply => BinaryOp::Multiply,
        BinaryOperatorKind::Divide => BinaryOp::Divide,
        BinaryOperatorKind::Modulus => BinaryOp::Modulus,
        operator => unreachable!("{operator:?} is not an arithmetic operator"),
    }
}

fn lower_compare_operator(operator: BinaryOperatorKind) -> CompareOp {
    match operator {
        BinaryOperatorKind::Equals => CompareOp::Equal,
        BinaryOperatorKind::NotEquals => CompareOp::NotEqual,
        BinaryOperatorKind::LessThan => CompareOp::LessThan,
        BinaryOperatorKind::LessThanOrEqualTo => CompareOp::LessThanOrEqual,
        BinaryOperatorKind::GreaterThan => CompareOp::GreaterThan,
        BinaryOperatorKind::GreaterThanOrEqualTo => CompareOp::GreaterThanOrEqual,
        operator => unreachable!("{operator:?} is not a comparison operator"),
    }
}
