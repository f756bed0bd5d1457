use std::sync::LazyLock;

/// Logical groups of `/GetState.csv` data columns.
///
/// Names follow the controller manual and are used verbatim on the CLI and in serialized output.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantArray,
    strum::VariantNames,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Category {
    /// Internal time of the controller when the request was processed.
    Time,
    Analog,
    Electrodes,
    Temperatures,
    /// Internal relays.
    Relays,
    DigitalInput,
    /// Relays on the relay extension board.
    ExternalRelays,
    /// Canister filling levels.
    Canister,
    CanisterConsumptions,
}

/// One declared piece of a category: a single column or an inclusive column range.
#[derive(Clone, Copy, Debug)]
pub enum Span {
    Column(usize),
    Columns(usize, usize),
}

impl Span {
    const fn bounds(&self) -> (usize, usize) {
        match *self {
            Span::Column(c) => (c, c),
            Span::Columns(start, end) => (start, end),
        }
    }

    fn expand(&self) -> impl Iterator<Item = usize> {
        let (start, end) = self.bounds();
        start..=end
    }
}

/// Number of data columns covered by the category table.
pub const COLUMN_COUNT: usize = 42;

macro_rules! categories {
    ($($category: ident: [$($from: literal $(..= $to: literal)?),*],)*) => {
        [$((Category::$category, &[$(categories!(@span $from $(, $to)?)),*])),*]
    };
    (@span $c: literal) => { Span::Column($c) };
    (@span $from: literal, $to: literal) => { Span::Columns($from, $to) };
}

const DECLARATIONS: [(Category, &[Span]); 9] = categories![
    Time: [0],
    Analog: [1..=5],
    Electrodes: [6, 7],
    Temperatures: [8..=15],
    Relays: [16..=23],
    DigitalInput: [24..=27],
    ExternalRelays: [28..=35],
    Canister: [36..=38],
    CanisterConsumptions: [39..=41],
];

const _ASSERT_COLUMNS_PARTITIONED: () = const {
    let mut column = 0;
    while column < COLUMN_COUNT {
        let mut hits = 0;
        let mut decl = 0;
        while decl < DECLARATIONS.len() {
            let spans = DECLARATIONS[decl].1;
            let mut span = 0;
            while span < spans.len() {
                let (start, end) = spans[span].bounds();
                if column >= start && column <= end {
                    hits += 1;
                }
                span += 1;
            }
            decl += 1;
        }
        assert!(hits == 1, "every data column must belong to exactly one category");
        column += 1;
    }
};

static INDEX: LazyLock<CategoryIndex> = LazyLock::new(CategoryIndex::build);

/// Expanded form of the category table: category to ordered absolute column ids.
pub struct CategoryIndex {
    columns: [Vec<usize>; DECLARATIONS.len()],
}

impl CategoryIndex {
    fn build() -> Self {
        let mut columns: [Vec<usize>; DECLARATIONS.len()] = Default::default();
        for (category, spans) in DECLARATIONS {
            columns[category as usize] = spans.iter().flat_map(Span::expand).collect();
        }
        Self { columns }
    }

    pub fn get() -> &'static CategoryIndex {
        &INDEX
    }

    pub fn columns(&self, category: Category) -> &[usize] {
        &self.columns[category as usize]
    }

    /// The first column of a category.
    pub fn first_column(&self, category: Category) -> usize {
        self.columns(category).iter().copied().min().unwrap_or(0)
    }

    pub fn category_of(&self, column: usize) -> Option<Category> {
        self.iter().find(|(_, columns)| columns.contains(&column)).map(|(c, _)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &[usize])> {
        <Category as strum::VariantArray>::VARIANTS
            .iter()
            .map(|&category| (category, self.columns(category)))
    }
}
