use crate::db::EngineKind;

#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub node_type: String,
    /// (startup, total). Oracle only reports a total, startup is 0.
    pub estimated_cost: Option<(f64, f64)>,
    pub actual_time: Option<(f64, f64)>,
    pub estimated_rows: Option<u64>,
    pub actual_rows: Option<u64>,
    pub loops: Option<u64>,
    /// Table or view read by this node, canonical lowercase.
    pub relation: Option<String>,
    /// Object named by the node (table, index, view), canonical lowercase.
    pub object: Option<String>,
    pub details: Vec<String>,
    pub children: Vec<PlanNode>,
    pub depth: usize,
}

impl PlanNode {
    fn new(node_type: String, depth: usize) -> Self {
        Self {
            node_type,
            estimated_cost: None,
            actual_time: None,
            estimated_rows: None,
            actual_rows: None,
            loops: None,
            relation: None,
            object: None,
            details: Vec::new(),
            children: Vec::new(),
            depth,
        }
    }

    pub fn relation(&self) -> Option<&str> {
        self.relation.as_deref()
    }

    /// This node and all its descendants, depth first.
    pub fn walk(&self) -> Vec<&PlanNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub engine: EngineKind,
    pub root: PlanNode,
    pub total_time: Option<f64>,
    pub planning_time: Option<f64>,
    pub execution_time: Option<f64>,
}

impl QueryPlan {
    pub fn top_operation(&self) -> &str {
        &self.root.node_type
    }

    /// Relations read by the plan, in order of first appearance.
    pub fn relations(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for node in self.root.walk() {
            if let Some(rel) = node.relation() {
                if !seen.contains(&rel) {
                    seen.push(rel);
                }
            }
        }
        seen
    }

    /// Indexes used by the plan, in order of first appearance.
    pub fn indexes(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for node in self.root.walk() {
            // `TABLE ACCESS BY INDEX ROWID` names its table, not the index.
            if !node.node_type.to_uppercase().contains("INDEX") || node.object == node.relation {
                continue;
            }
            if let Some(index) = node.object.as_deref() {
                if !seen.contains(&index) {
                    seen.push(index);
                }
            }
        }
        seen
    }

    /// Nodes whose actual row count is off by more than 10x.
    pub fn mismatches(&self) -> usize {
        self.root.walk().into_iter().filter(|n| rows_mismatch(n)).count()
    }
}

pub fn is_explain_query(query: &str) -> bool {
    let trimmed = query.trim().to_uppercase();
    trimmed.starts_with("EXPLAIN")
}

pub fn parse_plan(engine: EngineKind, text: &str) -> Option<QueryPlan> {
    match engine {
        EngineKind::Postgres => parse_explain_output(text),
        EngineKind::Oracle => parse_xplan_output(text),
    }
}

/// Parse PostgreSQL `EXPLAIN (FORMAT TEXT)` output, with or without ANALYZE.
pub fn parse_explain_output(text: &str) -> Option<QueryPlan> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let mut planning_time = None;
    let mut execution_time = None;

    // Extract timing info from the end
    for line in lines.iter().rev() {
        let trimmed = line.trim();
        if let Some(time_str) = trimmed
            .strip_prefix("Planning Time:")
            .or_else(|| trimmed.strip_prefix("Planning time:"))
        {
            planning_time = parse_time_ms(time_str);
        } else if let Some(time_str) = trimmed
            .strip_prefix("Execution Time:")
            .or_else(|| trimmed.strip_prefix("Execution time:"))
        {
            execution_time = parse_time_ms(time_str);
        }
    }

    let plan_lines: Vec<&str> = lines
        .iter()
        .filter(|l| {
            let t = l.trim();
            !t.starts_with("Planning")
                && !t.starts_with("Execution Time:")
                && !t.starts_with("Execution time:")
                && !t.starts_with("QUERY PLAN")
                && !t.starts_with("---")
                && !t.is_empty()
        })
        .copied()
        .collect();

    if plan_lines.is_empty() {
        return None;
    }

    let root = parse_node(&plan_lines, 0, 0).0?;
    let total_time = root.actual_time.map(|(_, end)| end);

    Some(QueryPlan {
        engine: EngineKind::Postgres,
        root,
        total_time,
        planning_time,
        execution_time,
    })
}

fn parse_time_ms(s: &str) -> Option<f64> {
    let s = s.trim().trim_end_matches("ms").trim();
    s.parse::<f64>().ok()
}

fn parse_node(lines: &[&str], start: usize, depth: usize) -> (Option<PlanNode>, usize) {
    if start >= lines.len() {
        return (None, start);
    }

    let first_line = lines[start];
    let node_indent = get_indent(first_line);
    let content = first_line.trim().trim_start_matches("->").trim();
    let mut node = parse_node_header(content, depth);

    let mut idx = start + 1;
    while idx < lines.len() {
        let line = lines[idx];
        let indent = get_indent(line);
        let trimmed = line.trim();

        if indent <= node_indent {
            // Back at the parent's level
            break;
        }

        if trimmed.starts_with("->") {
            let (child, next_idx) = parse_node(lines, idx, depth + 1);
            if let Some(child) = child {
                node.children.push(child);
            }
            idx = next_idx;
        } else {
            node.details.push(trimmed.to_string());
            idx += 1;
        }
    }

    (Some(node), idx)
}

fn get_indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn parse_node_header(s: &str, depth: usize) -> PlanNode {
    let head = match s.find("  (") {
        Some(pos) => &s[..pos],
        None => s.find(" (cost=").map_or(s, |pos| &s[..pos]),
    };
    let mut node = PlanNode::new(head.trim().to_string(), depth);
    if node.node_type.starts_with("Bitmap Index Scan") {
        node.object = pg_relation(&node.node_type);
    } else {
        node.relation = pg_relation(&node.node_type);
        node.object = pg_index(&node.node_type).or_else(|| node.relation.clone());
    }

    // (cost=X..Y rows=N width=W)
    if let Some(cost_start) = s.find("(cost=") {
        let rest = &s[cost_start..];
        if let Some(cost_str) = extract_between(rest, "(cost=", " ") {
            node.estimated_cost = parse_range(cost_str);
        }
        if let Some(rows_str) = extract_between(rest, "rows=", " ") {
            node.estimated_rows = rows_str.parse::<u64>().ok();
        }
    }

    // (actual time=X..Y rows=N loops=L)
    if let Some(actual_pos) = s.find("(actual") {
        let after_actual = &s[actual_pos..];
        if let Some(actual_str) = extract_between(after_actual, "time=", " ") {
            node.actual_time = parse_range(actual_str);
        }
        if let Some(rows_str) = extract_between(after_actual, "rows=", " ") {
            node.actual_rows = rows_str.parse::<u64>().ok();
        }
        if let Some(loops_str) = extract_between(after_actual, "loops=", ")") {
            node.loops = loops_str.parse::<u64>().ok();
        }
    }

    node
}

fn parse_range(s: &str) -> Option<(f64, f64)> {
    let (a, b) = s.split_once("..")?;
    Some((a.parse::<f64>().ok()?, b.parse::<f64>().ok()?))
}

/// `Index Scan using pk_groupe on public.groupe g` -> `groupe`.
fn pg_relation(node_type: &str) -> Option<String> {
    let (_, after) = node_type.rsplit_once(" on ")?;
    canonical_object(after.split_whitespace().next()?)
}

/// `Index Only Scan using pk_groupe on groupe` -> `pk_groupe`.
fn pg_index(node_type: &str) -> Option<String> {
    let (_, after) = node_type.split_once(" using ")?;
    canonical_object(after.split_whitespace().next()?)
}

fn canonical_object(name: &str) -> Option<String> {
    let name = name.rsplit('.').next().unwrap_or(name);
    let name = name.trim_matches('"');
    (!name.is_empty()).then(|| name.to_lowercase())
}

fn extract_between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_pos = s.find(start)? + start.len();
    let remaining = &s[start_pos..];
    let end_pos = remaining.find(end)?;
    Some(&remaining[..end_pos])
}

/// Column positions in a DBMS_XPLAN table.
#[derive(Debug, Default)]
struct XplanColumns {
    id: Option<usize>,
    operation: Option<usize>,
    name: Option<usize>,
    estimated_rows: Option<usize>,
    actual_rows: Option<usize>,
    cost: Option<usize>,
}

impl XplanColumns {
    fn from_header(cells: &[&str]) -> Option<Self> {
        let mut cols = XplanColumns::default();
        for (i, cell) in cells.iter().enumerate() {
            match cell.trim() {
                "Id" => cols.id = Some(i),
                "Operation" => cols.operation = Some(i),
                "Name" => cols.name = Some(i),
                "Rows" | "E-Rows" => cols.estimated_rows = Some(i),
                "A-Rows" => cols.actual_rows = Some(i),
                c if c.starts_with("Cost") => cols.cost = Some(i),
                _ => {}
            }
        }
        (cols.id.is_some() && cols.operation.is_some()).then_some(cols)
    }
}

/// Parse Oracle `DBMS_XPLAN.DISPLAY` / `DISPLAY_CURSOR` output.
pub fn parse_xplan_output(text: &str) -> Option<QueryPlan> {
    let mut columns: Option<XplanColumns> = None;
    let mut flat: Vec<(u32, PlanNode)> = Vec::new();
    let mut in_predicates = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Predicate Information") {
            in_predicates = true;
            continue;
        }
        if in_predicates {
            // "   2 - filter("STYLE"='Rock')"
            if let Some((id, detail)) = trimmed.split_once(" - ") {
                if let Ok(id) = id.trim_start_matches('*').trim().parse::<u32>() {
                    if let Some((_, node)) = flat.iter_mut().find(|(n, _)| *n == id) {
                        node.details.push(detail.trim().to_string());
                    }
                }
            }
            continue;
        }
        if !trimmed.starts_with('|') {
            continue;
        }

        let cells: Vec<&str> = trimmed.trim_matches('|').split('|').collect();
        let Some(cols) = &columns else {
            columns = XplanColumns::from_header(&cells);
            continue;
        };
        if XplanColumns::from_header(&cells).is_some() {
            continue;
        }

        let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).copied();
        let Some(id) = cell(cols.id)
            .map(|c| c.trim().trim_start_matches('*').trim())
            .and_then(|c| c.parse::<u32>().ok())
        else {
            continue;
        };
        let Some(raw_op) = cell(cols.operation) else {
            continue;
        };

        // One leading space is padding, each further space is a level.
        let depth = raw_op.len() - raw_op.trim_start().len();
        let mut node = PlanNode::new(raw_op.trim().to_string(), depth.saturating_sub(1));

        if let Some(name) = cell(cols.name).map(str::trim).filter(|n| !n.is_empty()) {
            let name = name.to_lowercase();
            let upper_op = node.node_type.to_uppercase();
            if upper_op.contains("TABLE ACCESS") || upper_op.contains("MAT_VIEW") {
                node.relation = Some(name.clone());
            }
            node.object = Some(name);
        }
        node.estimated_rows = cell(cols.estimated_rows).and_then(parse_xplan_count);
        node.actual_rows = cell(cols.actual_rows).and_then(parse_xplan_count);
        node.estimated_cost = cell(cols.cost)
            .and_then(|c| c.split_whitespace().next())
            .and_then(|c| c.parse::<f64>().ok())
            .map(|total| (0.0, total));

        flat.push((id, node));
    }

    if flat.is_empty() {
        return None;
    }

    let nodes: Vec<PlanNode> = flat.into_iter().map(|(_, n)| n).collect();
    let mut pos = 0;
    let root = build_tree(&nodes, &mut pos);

    Some(QueryPlan {
        engine: EngineKind::Oracle,
        root,
        total_time: None,
        planning_time: None,
        execution_time: None,
    })
}

/// Nest a pre-order list of nodes by their depth.
fn build_tree(nodes: &[PlanNode], pos: &mut usize) -> PlanNode {
    let mut node = nodes[*pos].clone();
    *pos += 1;
    while *pos < nodes.len() && nodes[*pos].depth > node.depth {
        node.children.push(build_tree(nodes, pos));
    }
    node
}

/// `500`, `15K`, `2M` -> count.
fn parse_xplan_count(cell: &str) -> Option<u64> {
    let cell = cell.trim();
    let (digits, factor) = match cell.chars().last()? {
        'K' => (&cell[..cell.len() - 1], 1_000),
        'M' => (&cell[..cell.len() - 1], 1_000_000),
        'G' => (&cell[..cell.len() - 1], 1_000_000_000),
        _ => (cell, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * factor)
}

pub fn rows_mismatch(node: &PlanNode) -> bool {
    if let (Some(est), Some(actual)) = (node.estimated_rows, node.actual_rows) {
        if est == 0 || actual == 0 {
            return est != actual;
        }
        let ratio = actual as f64 / est as f64;
        !(0.1..=10.0).contains(&ratio)
    } else {
        false
    }
}

pub fn format_duration_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.2}ms", ms)
    }
}
