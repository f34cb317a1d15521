use std::fmt;

use typereg::{TypeDescriptor, Value};

/// Index of a node inside an [`ExprTree`](crate::tree::ExprTree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    /// Static type of the value this node produces.
    pub ty: TypeDescriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Root sequence of a registered entity, supplied by the data source.
    Source { entity: TypeDescriptor },
    Constant(Value),
    /// Reference to a lambda parameter, bound by name to the innermost
    /// enclosing lambda declaring it.
    Parameter { name: String },
    Member { target: ExprId, member: String },
    Call { method: Method, args: Vec<ExprId> },
    Lambda {
        params: Vec<(String, TypeDescriptor)>,
        body: ExprId,
    },
    Binary {
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
    },
    Unary { op: UnaryOp, operand: ExprId },
    Conditional {
        test: ExprId,
        if_true: ExprId,
        if_false: ExprId,
    },
    /// Anonymous shape with ordered named fields.
    New { fields: Vec<(String, ExprId)> },
    /// Conversion of the operand to the node's type.
    Convert { operand: ExprId },
    /// A lambda passed as data to a query operator.
    Quote { operand: ExprId },
    /// User registered node kind, evaluated by a named extension.
    Extension { name: String, args: Vec<ExprId> },
}

impl ExprKind {
    /// Nodes this node references directly.
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            ExprKind::Source { .. } | ExprKind::Constant(_) | ExprKind::Parameter { .. } => {
                Vec::new()
            }
            ExprKind::Member { target, .. } => vec![*target],
            ExprKind::Call { args, .. } | ExprKind::Extension { args, .. } => args.clone(),
            ExprKind::Lambda { body, .. } => vec![*body],
            ExprKind::Binary { left, right, .. } => vec![*left, *right],
            ExprKind::Unary { operand, .. }
            | ExprKind::Convert { operand }
            | ExprKind::Quote { operand } => vec![*operand],
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => vec![*test, *if_true, *if_false],
            ExprKind::New { fields } => fields.iter().map(|(_, id)| *id).collect(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ExprKind::Source { .. } => "source",
            ExprKind::Constant(_) => "constant",
            ExprKind::Parameter { .. } => "parameter",
            ExprKind::Member { .. } => "member",
            ExprKind::Call { .. } => "call",
            ExprKind::Lambda { .. } => "lambda",
            ExprKind::Binary { .. } => "binary",
            ExprKind::Unary { .. } => "unary",
            ExprKind::Conditional { .. } => "conditional",
            ExprKind::New { .. } => "new",
            ExprKind::Convert { .. } => "convert",
            ExprKind::Quote { .. } => "quote",
            ExprKind::Extension { .. } => "extension",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 13] = [
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Rem,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.symbol() == s)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Negate => "-",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "!" => Some(UnaryOp::Not),
            "-" => Some(UnaryOp::Negate),
            _ => None,
        }
    }
}

macro_rules! methods {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Query operators and scalar functions a Call node can invoke.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)*
        }

        impl Method {
            pub const ALL: &'static [Method] = &[$(Method::$variant,)*];

            /// Stable name, also used on the wire.
            pub fn name(self) -> &'static str {
                match self {
                    $(Method::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Method::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

methods! {
    Where => "Where",
    Select => "Select",
    SelectMany => "SelectMany",
    OrderBy => "OrderBy",
    OrderByDescending => "OrderByDescending",
    ThenBy => "ThenBy",
    ThenByDescending => "ThenByDescending",
    GroupBy => "GroupBy",
    Join => "Join",
    Union => "Union",
    Intersect => "Intersect",
    Except => "Except",
    Concat => "Concat",
    Distinct => "Distinct",
    Count => "Count",
    Sum => "Sum",
    Min => "Min",
    Max => "Max",
    Average => "Average",
    Any => "Any",
    All => "All",
    Contains => "Contains",
    Skip => "Skip",
    Take => "Take",
    First => "First",
    FirstOrDefault => "FirstOrDefault",
    Single => "Single",
    SingleOrDefault => "SingleOrDefault",
    ToList => "ToList",
    ToDictionary => "ToDictionary",
    StringContains => "string.Contains",
    StartsWith => "string.StartsWith",
    EndsWith => "string.EndsWith",
    ToUpper => "string.ToUpper",
    ToLower => "string.ToLower",
    Trim => "string.Trim",
    Length => "string.Length",
    Substring => "string.Substring",
    ToString => "ToString",
    Year => "datetime.Year",
    Month => "datetime.Month",
    Day => "datetime.Day",
    AddDays => "datetime.AddDays",
}

impl Method {
    /// Whether the first argument is a sequence this method operates on.
    pub fn is_query_operator(self) -> bool {
        !matches!(
            self,
            Method::StringContains
                | Method::StartsWith
                | Method::EndsWith
                | Method::ToUpper
                | Method::ToLower
                | Method::Trim
                | Method::Length
                | Method::Substring
                | Method::ToString
                | Method::Year
                | Method::Month
                | Method::Day
                | Method::AddDays
        )
    }

    /// Name without the receiver type prefix, for display.
    pub fn short_name(self) -> &'static str {
        let name = self.name();
        match name.split_once('.') {
            Some((_, short)) => short,
            None => name,
        }
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Method::OrderBy | Method::OrderByDescending | Method::ThenBy | Method::ThenByDescending
        )
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn method_names_are_unique() {
        for method in Method::ALL {
            assert_eq!(Some(*method), Method::from_name(method.name()));
        }
    }

    #[rstest]
    #[case::operator(Method::Where, "Where", "Where")]
    #[case::ordering(Method::ThenByDescending, "ThenByDescending", "ThenByDescending")]
    #[case::string_function(Method::StringContains, "string.Contains", "Contains")]
    #[case::date_function(Method::Year, "datetime.Year", "Year")]
    fn method_names(#[case] method: Method, #[case] name: &str, #[case] short: &str) {
        assert_eq!(name, method.name());
        assert_eq!(short, method.short_name());
        assert_eq!(Some(method), Method::from_name(name));
    }

    #[rstest]
    #[case::short_name("Contains", Some(Method::Contains))]
    #[case::unknown("Aggregate", None)]
    #[case::wrong_case("where", None)]
    fn method_lookup(#[case] name: &str, #[case] expected: Option<Method>) {
        assert_eq!(expected, Method::from_name(name));
    }

    #[rstest]
    fn binary_symbols(
        #[values(
            BinaryOp::And,
            BinaryOp::Or,
            BinaryOp::Eq,
            BinaryOp::Ne,
            BinaryOp::Lt,
            BinaryOp::Le,
            BinaryOp::Gt,
            BinaryOp::Ge,
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::Div,
            BinaryOp::Rem
        )]
        op: BinaryOp,
    ) {
        assert!(BinaryOp::ALL.contains(&op));
        assert_eq!(Some(op), BinaryOp::from_symbol(op.symbol()));
    }

    #[rstest]
    #[case::not("!", Some(UnaryOp::Not))]
    #[case::negate("-", Some(UnaryOp::Negate))]
    #[case::binary_only("+", None)]
    fn unary_symbols(#[case] symbol: &str, #[case] expected: Option<UnaryOp>) {
        assert_eq!(expected, UnaryOp::from_symbol(symbol));
    }
}
